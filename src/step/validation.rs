//! プラットフォーム定義の静的検証
//!
//! ブラウザや認証情報ストアには一切触れない純粋関数。問題は1件ずつ
//! `(位置, 理由)` として集め、まとめて返す。

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::platform::{IntegrationMethod, PlatformDescriptor};
use crate::step::{StepKind, StepList};

/// ステップ列の区別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Login,
    Extraction,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Login => f.write_str("loginSteps"),
            Phase::Extraction => f.write_str("extractionSteps"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "at", rename_all = "snake_case")]
pub enum IssueLocation {
    /// ステップ列全体（順序の問題など）
    StepList { phase: Phase },
    Step { phase: Phase, order: u32 },
    /// 記述子・取込マッピングの項目名
    Field { name: String },
}

impl fmt::Display for IssueLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueLocation::StepList { phase } => write!(f, "{}", phase),
            IssueLocation::Step { phase, order } => write!(f, "{}[{}]", phase, order),
            IssueLocation::Field { name } => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub location: IssueLocation,
    pub reason: String,
}

impl ValidationIssue {
    fn step(phase: Phase, order: u32, reason: impl Into<String>) -> Self {
        Self {
            location: IssueLocation::Step { phase, order },
            reason: reason.into(),
        }
    }

    fn field(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            location: IssueLocation::Field { name: name.into() },
            reason: reason.into(),
        }
    }
}

/// 検証エラーの一覧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(Vec<ValidationIssue>);

impl ValidationErrors {
    pub fn issues(&self) -> &[ValidationIssue] {
        &self.0
    }

    pub fn into_issues(self) -> Vec<ValidationIssue> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, issue) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", issue.location, issue.reason)?;
        }
        Ok(())
    }
}

pub type ValidationResult = Result<(), ValidationErrors>;

/// プラットフォーム定義を検証する
pub fn validate(descriptor: &PlatformDescriptor) -> ValidationResult {
    let mut issues = Vec::new();

    if descriptor.id.trim().is_empty() {
        issues.push(ValidationIssue::field("id", "must not be empty"));
    }

    let credential_fields = check_credential_fields(descriptor, &mut issues);

    if descriptor.integration_method != IntegrationMethod::Rpa {
        for (phase, list) in [
            (Phase::Login, &descriptor.login_steps),
            (Phase::Extraction, &descriptor.extraction_steps),
        ] {
            if !list.is_empty() {
                issues.push(ValidationIssue {
                    location: IssueLocation::StepList { phase },
                    reason: format!(
                        "must be empty when integrationMethod is {}",
                        descriptor.integration_method
                    ),
                });
            }
        }
    } else {
        check_step_list(Phase::Login, &descriptor.login_steps, &credential_fields, &mut issues);
        check_step_list(
            Phase::Extraction,
            &descriptor.extraction_steps,
            &credential_fields,
            &mut issues,
        );
    }

    if let Err(reason) = descriptor.date_format.to_chrono() {
        issues.push(ValidationIssue::field("dateFormat", reason));
    }

    if let Some(input) = &descriptor.two_factor_input {
        if !descriptor.requires_two_factor {
            issues.push(ValidationIssue::field(
                "twoFactorInput",
                "only allowed when requires2FA is true",
            ));
        }
        for (name, selector) in [
            ("twoFactorInput.codeSelector", input.code_selector.as_ref()),
            ("twoFactorInput.submitSelector", input.submit_selector.as_ref()),
        ] {
            if selector.is_some_and(|s| s.value.trim().is_empty()) {
                issues.push(ValidationIssue::field(name, "must not be empty"));
            }
        }
    }

    for (name, reason) in descriptor.import_mapping.check() {
        issues.push(ValidationIssue::field(name, reason));
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(issues))
    }
}

fn check_credential_fields<'a>(
    descriptor: &'a PlatformDescriptor,
    issues: &mut Vec<ValidationIssue>,
) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    for field in &descriptor.credential_fields {
        if field.trim().is_empty() {
            issues.push(ValidationIssue::field("credentialFields", "field names must not be empty"));
        } else if !seen.insert(field.as_str()) {
            issues.push(ValidationIssue::field(
                "credentialFields",
                format!("duplicate field '{}'", field),
            ));
        }
    }
    seen
}

fn check_step_list(
    phase: Phase,
    list: &StepList,
    credential_fields: &HashSet<&str>,
    issues: &mut Vec<ValidationIssue>,
) {
    if let Some(reason) = ordering_problem(list) {
        issues.push(ValidationIssue {
            location: IssueLocation::StepList { phase },
            reason,
        });
    }

    for step in list {
        if let Err(reasons) = step.action() {
            for reason in reasons {
                issues.push(ValidationIssue::step(phase, step.order, reason));
            }
        }

        if step.kind == StepKind::FillCredential {
            if let Some(field) = step.credential_field.as_deref().filter(|f| !f.trim().is_empty()) {
                if !credential_fields.contains(field) {
                    issues.push(ValidationIssue::step(
                        phase,
                        step.order,
                        format!("credentialField '{}' is not declared in credentialFields", field),
                    ));
                }
            }
        }
    }
}

/// 順序の重複・欠番をまとめて1件の理由にする
fn ordering_problem(list: &StepList) -> Option<String> {
    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for step in list {
        if !seen.insert(step.order) {
            duplicates.insert(step.order);
        }
    }

    let expected = 1..=list.len() as u32;
    let missing: Vec<u32> = expected.filter(|o| !seen.contains(o)).collect();

    if duplicates.is_empty() && missing.is_empty() {
        return None;
    }

    let mut parts = Vec::new();
    if !duplicates.is_empty() {
        parts.push(format!("duplicate order {:?}", duplicates.into_iter().collect::<Vec<_>>()));
    }
    if !missing.is_empty() {
        parts.push(format!("missing order {:?}", missing));
    }
    Some(format!(
        "order must be unique and dense 1..{}: {}",
        list.len(),
        parts.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::{DataType, FieldMapping, FileKind, ImportMapping};
    use crate::platform::{LoginType, TwoFactorInput};
    use crate::step::{Selector, Step};

    fn mapping() -> ImportMapping {
        ImportMapping {
            file_kind: FileKind::Csv,
            header_row: 1,
            first_data_row: 2,
            csv_delimiter: None,
            fields: vec![
                FieldMapping::new("date", "Data", DataType::Date, true),
                FieldMapping::new("amount", "Valor", DataType::Currency, true),
            ],
        }
    }

    fn descriptor() -> PlatformDescriptor {
        PlatformDescriptor {
            id: "toll-operator".into(),
            integration_method: IntegrationMethod::Rpa,
            login_type: LoginType::Automatic,
            requires_two_factor: false,
            two_factor_kind: None,
            two_factor_input: None,
            date_format: Default::default(),
            credential_fields: vec!["username".into(), "password".into()],
            login_steps: vec![
                Step::new(StepKind::Goto).with_literal("https://example.test/login"),
                Step::new(StepKind::FillCredential)
                    .with_selector("#user")
                    .with_credential("username"),
                Step::new(StepKind::FillCredential)
                    .with_selector("#pass")
                    .with_credential("password"),
                Step::new(StepKind::Click).with_selector("button[type=submit]"),
            ]
            .into_iter()
            .collect(),
            extraction_steps: vec![
                Step::new(StepKind::FillDateStart).with_selector("#from"),
                Step::new(StepKind::FillDateEnd).with_selector("#to"),
                Step::new(StepKind::Click).with_selector("#export"),
                Step::new(StepKind::Download).with_timeout_ms(10_000),
            ]
            .into_iter()
            .collect(),
            import_mapping: mapping(),
        }
    }

    #[test]
    fn test_valid_descriptor_passes() {
        assert_eq!(validate(&descriptor()), Ok(()));
    }

    #[test]
    fn test_duplicate_order_yields_one_issue_per_list() {
        let mut d = descriptor();
        let mut login: Vec<Step> = d.login_steps.steps().to_vec();
        login[2].order = 2;
        login[3].order = 2;
        d.login_steps = StepList::from_stored(login);

        let mut extraction: Vec<Step> = d.extraction_steps.steps().to_vec();
        extraction[1].order = 1;
        d.extraction_steps = StepList::from_stored(extraction);

        let errors = validate(&d).unwrap_err();
        let ordering: Vec<_> = errors
            .issues()
            .iter()
            .filter(|i| matches!(i.location, IssueLocation::StepList { .. }))
            .collect();
        assert_eq!(ordering.len(), 2);
        assert_eq!(
            ordering[0].location,
            IssueLocation::StepList { phase: Phase::Login }
        );
        assert!(ordering[0].reason.contains("duplicate order [2]"));
        assert!(ordering[0].reason.contains("missing order [3, 4]"));
        assert_eq!(
            ordering[1].location,
            IssueLocation::StepList { phase: Phase::Extraction }
        );
    }

    #[test]
    fn test_undeclared_credential_field_fails_validation() {
        let mut d = descriptor();
        d.login_steps.push(
            Step::new(StepKind::FillCredential)
                .with_selector("#otp-seed")
                .with_credential("pin"),
        );

        let errors = validate(&d).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors.issues()[0].location,
            IssueLocation::Step { phase: Phase::Login, order: 5 }
        );
        assert!(errors.issues()[0].reason.contains("'pin'"));
    }

    #[test]
    fn test_non_rpa_platform_must_not_carry_steps() {
        let mut d = descriptor();
        d.integration_method = IntegrationMethod::ManualUpload;
        let errors = validate(&d).unwrap_err();
        assert_eq!(errors.len(), 2);

        d.login_steps = StepList::new();
        d.extraction_steps = StepList::new();
        assert!(validate(&d).is_ok());
    }

    #[test]
    fn test_mapping_and_descriptor_level_issues_are_collected() {
        let mut d = descriptor();
        d.credential_fields.push("password".into());
        d.import_mapping.fields.push(FieldMapping::new("amount", "Total", DataType::Number, false));
        d.import_mapping.fields.push(FieldMapping::new("driver", " ", DataType::Text, true));
        d.import_mapping.first_data_row = 1;
        d.two_factor_input = Some(TwoFactorInput {
            code_selector: Some(Selector::css("#otp")),
            submit_selector: None,
        });

        let errors = validate(&d).unwrap_err();
        let names: Vec<String> = errors
            .issues()
            .iter()
            .map(|i| i.location.to_string())
            .collect();
        assert!(names.contains(&"credentialFields".to_string()));
        assert!(names.contains(&"twoFactorInput".to_string()));
        assert!(names.contains(&"importMapping.firstDataRow".to_string()));
        assert!(names.contains(&"importMapping.fields.amount".to_string()));
        assert!(names.contains(&"importMapping.fields.driver".to_string()));
        // 検証エラーの文字列表現に全件が含まれる
        assert_eq!(errors.to_string().matches("; ").count(), errors.len() - 1);
    }

    #[test]
    fn test_step_level_issue_carries_order() {
        let mut d = descriptor();
        d.extraction_steps.insert(1, Step::new(StepKind::WaitSelector));
        let errors = validate(&d).unwrap_err();
        assert_eq!(
            errors.issues()[0],
            ValidationIssue::step(Phase::Extraction, 1, "selector is required for wait_selector")
        );
    }
}
