//! ステップ定義
//!
//! 管理者が作成する自動化スクリプトの1命令。保存形式はフラットなレコードで、
//! 実行前に [`Step::action`] で種別ごとの [`Action`] に変換する。

use std::fmt;

use serde::{Deserialize, Serialize};

/// ステップ種別（実行時に拡張されない閉じた集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Goto,
    Click,
    Type,
    FillCredential,
    FillDateStart,
    FillDateEnd,
    Select,
    Wait,
    WaitSelector,
    Press,
    Download,
    Screenshot,
}

impl StepKind {
    pub fn requires_selector(&self) -> bool {
        !matches!(
            self,
            StepKind::Goto | StepKind::Wait | StepKind::Download | StepKind::Screenshot
        )
    }

    pub fn requires_literal(&self) -> bool {
        matches!(self, StepKind::Type | StepKind::Goto)
    }

    /// select は選択値、press はキー名として literalValue を使う
    pub fn accepts_literal(&self) -> bool {
        matches!(
            self,
            StepKind::Type | StepKind::Goto | StepKind::Select | StepKind::Press
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Goto => "goto",
            StepKind::Click => "click",
            StepKind::Type => "type",
            StepKind::FillCredential => "fill_credential",
            StepKind::FillDateStart => "fill_date_start",
            StepKind::FillDateEnd => "fill_date_end",
            StepKind::Select => "select",
            StepKind::Wait => "wait",
            StepKind::WaitSelector => "wait_selector",
            StepKind::Press => "press",
            StepKind::Download => "download",
            StepKind::Screenshot => "screenshot",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorStrategy {
    #[default]
    Css,
    Xpath,
}

/// 戦略付きセレクタ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub value: String,
    #[serde(default)]
    pub strategy: SelectorStrategy,
}

impl Selector {
    pub fn css(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            strategy: SelectorStrategy::Css,
        }
    }

    pub fn xpath(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            strategy: SelectorStrategy::Xpath,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.strategy {
            SelectorStrategy::Css => write!(f, "css={}", self.value),
            SelectorStrategy::Xpath => write!(f, "xpath={}", self.value),
        }
    }
}

/// 期間の境界
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateBound {
    Start,
    End,
}

/// 保存形式のステップ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub order: u32,
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default)]
    pub selector_strategy: SelectorStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Step {
    pub fn new(kind: StepKind) -> Self {
        Self {
            order: 0,
            kind,
            selector: None,
            selector_strategy: SelectorStrategy::Css,
            literal_value: None,
            credential_field: None,
            timeout_ms: None,
        }
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_xpath(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self.selector_strategy = SelectorStrategy::Xpath;
        self
    }

    pub fn with_literal(mut self, value: impl Into<String>) -> Self {
        self.literal_value = Some(value.into());
        self
    }

    pub fn with_credential(mut self, field: impl Into<String>) -> Self {
        self.credential_field = Some(field.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    fn present(value: &Option<String>) -> Option<&str> {
        value.as_deref().filter(|v| !v.trim().is_empty())
    }

    /// 実行用の型付き表現に変換する。不足項目は理由の一覧で返す
    pub fn action(&self) -> Result<Action, Vec<String>> {
        let mut reasons = Vec::new();

        let selector = match Self::present(&self.selector) {
            Some(value) => Some(Selector {
                value: value.to_string(),
                strategy: self.selector_strategy,
            }),
            None => {
                if self.kind.requires_selector() {
                    reasons.push(format!("selector is required for {}", self.kind));
                }
                None
            }
        };

        let literal = Self::present(&self.literal_value).map(str::to_string);
        if self.kind.requires_literal() && literal.is_none() {
            reasons.push(format!("literalValue is required for {}", self.kind));
        }
        if !self.kind.accepts_literal() && literal.is_some() {
            reasons.push(format!(
                "literalValue is only allowed on type/goto/select/press, not {}",
                self.kind
            ));
        }

        let credential = Self::present(&self.credential_field).map(str::to_string);
        match (self.kind, &credential) {
            (StepKind::FillCredential, None) => {
                reasons.push("credentialField is required for fill_credential".into())
            }
            (StepKind::FillCredential, Some(_)) | (_, None) => {}
            (kind, Some(_)) => {
                reasons.push(format!("credentialField is only allowed on fill_credential, not {}", kind))
            }
        }

        if self.kind == StepKind::Wait && self.timeout_ms.is_none() {
            reasons.push("timeoutMs is required for wait".into());
        }
        if self.timeout_ms == Some(0) && self.kind != StepKind::Wait {
            reasons.push("timeoutMs must be greater than 0".into());
        }

        if !reasons.is_empty() {
            return Err(reasons);
        }

        // 上の検査を通過していれば必須項目は揃っている
        let sel = || selector.clone().ok_or_else(|| vec!["selector missing".to_string()]);
        let lit = || literal.clone().ok_or_else(|| vec!["literalValue missing".to_string()]);

        let action = match self.kind {
            StepKind::Goto => Action::Goto {
                url: lit()?,
                timeout_ms: self.timeout_ms,
            },
            StepKind::Click => Action::Click { selector: sel()? },
            StepKind::Type => Action::Type {
                selector: sel()?,
                text: lit()?,
            },
            StepKind::FillCredential => Action::FillCredential {
                selector: sel()?,
                field: credential.ok_or_else(|| vec!["credentialField missing".to_string()])?,
            },
            StepKind::FillDateStart => Action::FillDate {
                selector: sel()?,
                bound: DateBound::Start,
            },
            StepKind::FillDateEnd => Action::FillDate {
                selector: sel()?,
                bound: DateBound::End,
            },
            StepKind::Select => Action::Select {
                selector: sel()?,
                value: literal,
            },
            StepKind::Wait => Action::Wait {
                duration_ms: self.timeout_ms.unwrap_or_default(),
            },
            StepKind::WaitSelector => Action::WaitSelector {
                selector: sel()?,
                timeout_ms: self.timeout_ms,
            },
            StepKind::Press => Action::Press {
                selector: sel()?,
                key: literal.unwrap_or_else(|| DEFAULT_PRESS_KEY.to_string()),
            },
            StepKind::Download => Action::Download {
                timeout_ms: self.timeout_ms,
            },
            StepKind::Screenshot => Action::Screenshot,
        };
        Ok(action)
    }
}

pub const DEFAULT_PRESS_KEY: &str = "Enter";

/// 種別ごとに必要なデータだけを持つ実行形式
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Goto {
        url: String,
        timeout_ms: Option<u64>,
    },
    Click {
        selector: Selector,
    },
    Type {
        selector: Selector,
        text: String,
    },
    FillCredential {
        selector: Selector,
        field: String,
    },
    FillDate {
        selector: Selector,
        bound: DateBound,
    },
    Select {
        selector: Selector,
        value: Option<String>,
    },
    Wait {
        duration_ms: u64,
    },
    WaitSelector {
        selector: Selector,
        timeout_ms: Option<u64>,
    },
    Press {
        selector: Selector,
        key: String,
    },
    Download {
        timeout_ms: Option<u64>,
    },
    Screenshot,
}

impl Action {
    pub fn selector(&self) -> Option<&Selector> {
        match self {
            Action::Click { selector }
            | Action::Type { selector, .. }
            | Action::FillCredential { selector, .. }
            | Action::FillDate { selector, .. }
            | Action::Select { selector, .. }
            | Action::WaitSelector { selector, .. }
            | Action::Press { selector, .. } => Some(selector),
            Action::Goto { .. } | Action::Wait { .. } | Action::Download { .. } | Action::Screenshot => {
                None
            }
        }
    }
}

/// 順序付きステップ列。`order` は常に 1..N で詰める
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepList(Vec<Step>);

impl StepList {
    pub fn new() -> Self {
        Self::default()
    }

    /// 保存済みの順序をそのまま保持する（検証前の取込用）
    pub fn from_stored(steps: Vec<Step>) -> Self {
        Self(steps)
    }

    pub fn push(&mut self, mut step: Step) {
        step.order = self.0.len() as u32 + 1;
        self.0.push(step);
    }

    /// `position`（1始まり）に挿入して後続を繰り下げる
    pub fn insert(&mut self, position: u32, step: Step) {
        let index = (position.max(1) as usize - 1).min(self.0.len());
        self.0.insert(index, step);
        self.renumber();
    }

    pub fn remove(&mut self, order: u32) -> Option<Step> {
        let index = self.0.iter().position(|s| s.order == order)?;
        let removed = self.0.remove(index);
        self.renumber();
        Some(removed)
    }

    pub fn move_step(&mut self, from: u32, to: u32) -> bool {
        match self.remove(from) {
            Some(step) => {
                self.insert(to, step);
                true
            }
            None => false,
        }
    }

    /// 現在の `order` で安定ソートしてから 1..N を振り直す
    pub fn resequence(&mut self) {
        self.0.sort_by_key(|s| s.order);
        self.renumber();
    }

    fn renumber(&mut self) {
        for (i, step) in self.0.iter_mut().enumerate() {
            step.order = i as u32 + 1;
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.0
    }

    /// `order` の昇順（同順位は格納順）
    pub fn in_order(&self) -> Vec<&Step> {
        let mut steps: Vec<&Step> = self.0.iter().collect();
        steps.sort_by_key(|s| s.order);
        steps
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Step> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Step> for StepList {
    fn from_iter<I: IntoIterator<Item = Step>>(iter: I) -> Self {
        let mut list = StepList::new();
        for step in iter {
            list.push(step);
        }
        list
    }
}

impl<'a> IntoIterator for &'a StepList {
    type Item = &'a Step;
    type IntoIter = std::slice::Iter<'a, Step>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
