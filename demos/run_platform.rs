use std::sync::Arc;

use chrono::NaiveDate;
use platform_scraper::{
    EngineConfig, InMemoryCredentialStore, PlatformDescriptor, RunOrchestrator, RunRequest, RunState,
    TwoFactorSignal,
};

// 使い方:
//   PLATFORM_USERNAME=... PLATFORM_PASSWORD=... \
//   cargo run --example run_platform -- demos/tolls.json driver-1 2024-11-04 2024-11-10
#[tokio::main]
async fn main() {
    // ログ設定
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "platform_scraper=debug".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 5 {
        eprintln!("usage: run_platform <descriptor.json> <principal> <start> <end>");
        std::process::exit(2);
    }
    let descriptor = std::fs::read_to_string(&args[1]).expect("Failed to read descriptor");
    let principal = &args[2];
    let start: NaiveDate = args[3].parse().expect("start must be YYYY-MM-DD");
    let end: NaiveDate = args[4].parse().expect("end must be YYYY-MM-DD");

    let platform = match PlatformDescriptor::from_json(&descriptor) {
        Ok(platform) => platform,
        Err(e) => {
            eprintln!("定義エラー: {}", e);
            std::process::exit(1);
        }
    };
    let platform_id = platform.id.clone();

    // 環境変数から認証情報を取得（PLATFORM_<FIELD>）
    let mut credentials = InMemoryCredentialStore::new();
    for field in &platform.credential_fields {
        let key = format!("PLATFORM_{}", field.to_uppercase());
        let value = std::env::var(&key).unwrap_or_else(|_| panic!("{} environment variable not set", key));
        credentials.insert(&platform_id, principal, field, value);
    }

    let config = EngineConfig::from_env().with_headless(false); // デバッグ用に表示モード
    let orchestrator = RunOrchestrator::chromium(config, Arc::new(credentials));
    orchestrator
        .register_platform(platform)
        .expect("Failed to register platform");

    println!("=== Platform Run: {} ===", platform_id);

    let run_id = match orchestrator.submit(RunRequest::new(&platform_id, principal, start, end)) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("エラー: {}", e);
            std::process::exit(1);
        }
    };

    // 2段階認証が必要なら標準入力からコードを受け取る
    let waiter = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.wait(run_id).await })
    };
    loop {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        match orchestrator.status(run_id) {
            Ok(RunState::AwaitingTwoFactor) => {
                println!("2段階認証コードを入力してください（空行で完了通知のみ）:");
                let mut line = String::new();
                std::io::stdin().read_line(&mut line).ok();
                let signal = match line.trim() {
                    "" => TwoFactorSignal::Ack,
                    code => TwoFactorSignal::Code(code.into()),
                };
                if let Err(e) = orchestrator.signal_two_factor(run_id, signal) {
                    eprintln!("エラー: {}", e);
                }
            }
            Ok(state) if state.is_terminal() => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("エラー: {}", e);
                break;
            }
        }
    }

    match waiter.await {
        Ok(Ok(report)) => {
            println!("状態: {}", report.state);
            println!("レコード: {} / 除外: {}", report.records.len(), report.rejected.len());
            for error in &report.errors {
                println!("  {:?} (step {:?}): {}", error.kind, error.order, error.message);
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&report.records).unwrap_or_default()
            );
        }
        Ok(Err(e)) => eprintln!("エラー: {}", e),
        Err(e) => eprintln!("エラー: {}", e),
    }
}
