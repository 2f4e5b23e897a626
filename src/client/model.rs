//! Wire types: the Web backend's JSON resources plus the manager/executor
//! link (judgment results and executor status reports).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct Judgment {
    pub submission_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Submission {
    pub problem_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Problem {
    pub id: i64,
    pub template_id: i64,
    #[serde(default)]
    pub has_autograder: bool,
    /// Only meaningful when `has_autograder` is set.
    #[serde(default)]
    pub unit_test_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionCode {
    pub attachment_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateMeta {
    /// ISO-8601; compared against the cached copy's timestamp.
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionImplCreated {
    pub function_impl_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub return_type: String,
    /// Either a free function name or `Class::method`.
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<FunctionParameter>,
}

impl FunctionSignature {
    /// All type strings of the signature, return type first, deduplicated
    /// while preserving first-occurrence order.
    pub fn distinct_types(&self) -> Vec<String> {
        let mut types = vec![self.return_type.clone()];
        for param in &self.parameters {
            if !types.contains(&param.ty) {
                types.push(param.ty.clone());
            }
        }
        types
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionRequirement {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub problem_id: i64,
    /// Relative to the template root.
    pub source_file_path: String,
    pub function_signature: FunctionSignature,
}

/// The one-of-three verdict the Web backend ultimately sees. `Error` means
/// the judge itself malfunctioned, not that the student code is wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictKind {
    Passed,
    Failed,
    Error,
}

/// Pipeline → manager result report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgmentResult {
    pub result: VerdictKind,
    pub log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_impls: Option<Vec<String>>,
}

/// Executor → manager heartbeat payload. Stored verbatim as the executor
/// row's `data` blob; the dispatcher only ever looks at `is_alive`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorStatus {
    pub hostname: String,
    pub cpu_model_name: String,
    pub n_cpus: u32,
    pub memory_mib: u64,
    pub is_alive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn function_requirement_from_backend_json() {
        let raw = r#"{
            "id": 3,
            "problem_id": 12,
            "source_file_path": "src/geo.cc",
            "function_signature": {
                "return_type": "Vec3",
                "name": "Mesh::normal",
                "parameters": [{"name": "i", "type": "size_t"}]
            }
        }"#;
        let req: FunctionRequirement = serde_json::from_str(raw).unwrap();
        assert_eq!(req.source_file_path, "src/geo.cc");
        assert_eq!(req.function_signature.name, "Mesh::normal");
        assert_eq!(req.function_signature.parameters[0].ty, "size_t");
    }

    #[test]
    fn distinct_types_keeps_order_and_dedups() {
        let sig = FunctionSignature {
            return_type: "Vec3".into(),
            name: "lerp".into(),
            parameters: vec![
                FunctionParameter { name: "a".into(), ty: "Vec3".into() },
                FunctionParameter { name: "b".into(), ty: "Vec3".into() },
                FunctionParameter { name: "t".into(), ty: "float".into() },
            ],
        };
        assert_eq!(sig.distinct_types(), vec!["Vec3".to_owned(), "float".to_owned()]);
    }

    #[test]
    fn verdict_wire_spelling() {
        assert_eq!(serde_json::to_string(&VerdictKind::Passed).unwrap(), "\"passed\"");
        let result: JudgmentResult =
            serde_json::from_str(r#"{"result": "failed", "log": "boom"}"#).unwrap();
        assert_eq!(result.result, VerdictKind::Failed);
        assert!(result.function_impls.is_none());
    }

    #[test]
    fn result_serialization_omits_absent_impls() {
        let result = JudgmentResult {
            result: VerdictKind::Passed,
            log: String::new(),
            function_impls: None,
        };
        let raw = serde_json::to_value(&result).unwrap();
        assert!(raw.get("function_impls").is_none());
    }
}
