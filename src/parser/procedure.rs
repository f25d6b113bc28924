use regex::{Regex, RegexBuilder};

use super::classifier::{ParsedQuery, SqlCommand};

/// Kind of procedure-related statement detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureType {
    Call,
    CreateProcedure,
    AlterProcedure,
    DropProcedure,
    /// PREPARE/EXECUTE; the SQL literal inside PREPARE is never inspected
    PrepareExecute,
}

#[derive(Debug, Clone)]
pub struct ProcedureInfo {
    pub procedure_type: ProcedureType,
    /// Only populated for CALL
    pub procedure_name: String,
    pub is_dynamic_sql: bool,
}

/// Flags CALL, CREATE/ALTER/DROP PROCEDURE, and PREPARE/EXECUTE (the last
/// pair marked as dynamic SQL so the policy layer can refuse the bypass).
pub struct ProcedureDetector {
    call_re: Regex,
    procedure_word_re: Regex,
}

impl ProcedureDetector {
    pub fn new() -> Self {
        Self {
            call_re: RegexBuilder::new(r"CALL\s+([\w.]+)\s*\(")
                .case_insensitive(true)
                .build()
                .expect("constant pattern"),
            procedure_word_re: RegexBuilder::new(r"\bPROCEDURE\b")
                .case_insensitive(true)
                .build()
                .expect("constant pattern"),
        }
    }

    pub fn detect(&self, query: &ParsedQuery) -> Option<ProcedureInfo> {
        match query.command {
            SqlCommand::Call => {
                let procedure_name = self
                    .call_re
                    .captures(&query.raw_sql)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                Some(ProcedureInfo {
                    procedure_type: ProcedureType::Call,
                    procedure_name,
                    is_dynamic_sql: false,
                })
            }
            SqlCommand::Create if self.procedure_word_re.is_match(&query.raw_sql) => {
                Some(ProcedureInfo {
                    procedure_type: ProcedureType::CreateProcedure,
                    procedure_name: String::new(),
                    is_dynamic_sql: false,
                })
            }
            SqlCommand::Alter if self.procedure_word_re.is_match(&query.raw_sql) => {
                Some(ProcedureInfo {
                    procedure_type: ProcedureType::AlterProcedure,
                    procedure_name: String::new(),
                    is_dynamic_sql: false,
                })
            }
            SqlCommand::Drop if self.procedure_word_re.is_match(&query.raw_sql) => {
                Some(ProcedureInfo {
                    procedure_type: ProcedureType::DropProcedure,
                    procedure_name: String::new(),
                    is_dynamic_sql: false,
                })
            }
            SqlCommand::Prepare | SqlCommand::Execute => Some(ProcedureInfo {
                procedure_type: ProcedureType::PrepareExecute,
                procedure_name: String::new(),
                is_dynamic_sql: true,
            }),
            _ => None,
        }
    }
}

impl Default for ProcedureDetector {
    fn default() -> Self {
        Self::new()
    }
}
