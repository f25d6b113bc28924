//! Policy evaluation pipeline.
//!
//! Fail-close rules, in force everywhere:
//!   1. no config snapshot -> Block
//!   2. unknown SQL command -> Block
//!   3. parser error -> Block (`evaluate_error`)
//!   4. no matching access rule -> Block
//!   5. Allow is returned only at the end of the happy path
//!
//! Hot reload swaps the snapshot behind a lock; every evaluation clones the
//! `Arc` once up front and runs to completion against that snapshot.

use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Timelike;
use tracing::{debug, info, warn};

use crate::error::ParseError;
use crate::parser::{ParsedQuery, SqlCommand};
use crate::session::SessionContext;

use super::rules::PolicyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Allow,
    Block,
    /// Audit-only verdict; the session relays it like Allow
    #[allow(dead_code)]
    Log,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Allow => "ALLOW",
            PolicyAction::Block => "BLOCK",
            PolicyAction::Log => "LOG",
        }
    }
}

/// Evaluation verdict. The default is Block so an uninitialized or
/// short-circuited result can never turn permissive.
#[derive(Debug, Clone)]
pub struct PolicyResult {
    pub action: PolicyAction,
    pub matched_rule: String,
    pub reason: String,
}

impl PolicyResult {
    fn block(matched_rule: &str, reason: impl Into<String>) -> Self {
        Self {
            action: PolicyAction::Block,
            matched_rule: matched_rule.to_string(),
            reason: reason.into(),
        }
    }
}

impl Default for PolicyResult {
    fn default() -> Self {
        Self::block("default-deny", "Uninitialized policy result")
    }
}

/// Policy engine holding the swappable config snapshot.
pub struct PolicyEngine {
    config: RwLock<Option<Arc<PolicyConfig>>>,
}

impl PolicyEngine {
    pub fn new(config: Option<Arc<PolicyConfig>>) -> Self {
        match &config {
            None => warn!("policy engine starting without config, all queries will be blocked"),
            Some(cfg) => info!(
                access_rules = cfg.access_control.len(),
                block_statements = cfg.sql_rules.block_statements.len(),
                block_patterns = cfg.sql_rules.block_patterns.len(),
                "policy engine initialized"
            ),
        }
        Self {
            config: RwLock::new(config),
        }
    }

    /// Install a new snapshot. In-flight evaluations finish against the
    /// snapshot they already cloned. `None` is legal and blocks all
    /// subsequent traffic.
    pub fn reload(&self, next: Option<Arc<PolicyConfig>>) {
        match &next {
            None => warn!("policy reloaded with empty config, all queries will be blocked"),
            Some(cfg) => info!(access_rules = cfg.access_control.len(), "policy reloaded"),
        }
        *self
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Current snapshot, for operational read-only surfaces.
    pub fn snapshot(&self) -> Option<Arc<PolicyConfig>> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mandatory fail-close entry point for classifier failures.
    pub fn evaluate_error(&self, error: &ParseError, session: &SessionContext) -> PolicyResult {
        warn!(
            session_id = session.session_id,
            kind = ?error.kind,
            message = %error.message,
            context = %error.context,
            "parse error, blocking"
        );
        PolicyResult::block("parse-error", format!("Parser error: {}", error.message))
    }

    /// Run the ordered rule pipeline. The first matching rule decides; any
    /// rule whose precondition cannot be evaluated blocks.
    pub fn evaluate(&self, query: &ParsedQuery, session: &SessionContext) -> PolicyResult {
        // Step 1: snapshot present?
        let Some(config) = self.snapshot() else {
            warn!(session_id = session.session_id, "no policy config, blocking");
            return PolicyResult::block("no-config", "Policy config unavailable");
        };

        // Step 2: unknown command
        if query.command == SqlCommand::Unknown {
            let prefix: String = query.raw_sql.chars().take(50).collect();
            warn!(
                session_id = session.session_id,
                sql_prefix = %prefix,
                "unknown SQL command blocked"
            );
            return PolicyResult::block("unknown-command", "Unknown SQL command blocked");
        }

        let cmd_str = query.command.as_str();

        // Step 3: statement-level blocks
        for stmt in &config.sql_rules.block_statements {
            if stmt.eq_ignore_ascii_case(cmd_str) {
                info!(
                    session_id = session.session_id,
                    user = %session.db_user,
                    statement = %stmt,
                    "block_statement matched"
                );
                return PolicyResult::block(
                    "block-statement",
                    format!("SQL statement blocked: {stmt}"),
                );
            }
        }

        // Step 4: pattern-level blocks. Patterns that fail to compile are
        // skipped (coverage loss, warned at load time), not turned into a
        // blanket block.
        for pattern in &config.sql_rules.block_patterns {
            match regex::RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => {
                    if re.is_match(&query.raw_sql) {
                        info!(
                            session_id = session.session_id,
                            user = %session.db_user,
                            pattern = %pattern,
                            "block_pattern matched"
                        );
                        return PolicyResult::block(
                            "block-pattern",
                            format!("SQL pattern blocked: {pattern}"),
                        );
                    }
                }
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "invalid block_pattern, skipping");
                }
            }
        }

        // Step 5: find the first matching access rule
        let matched_rule = config.access_control.iter().find(|rule| {
            let user_match = rule.user == "*" || rule.user == session.db_user;
            if !user_match {
                return false;
            }
            rule.source_ip_cidr.is_empty() || ip_in_cidr(&session.client_ip, &rule.source_ip_cidr)
        });

        let Some(rule) = matched_rule else {
            info!(
                session_id = session.session_id,
                user = %session.db_user,
                client_ip = %session.client_ip,
                "no matching access rule"
            );
            return PolicyResult::block("no-access-rule", "No matching access rule for user/IP");
        };

        // Step 6: blocked operations beat everything below
        for blocked_op in &rule.blocked_operations {
            if blocked_op.eq_ignore_ascii_case(cmd_str) {
                info!(
                    session_id = session.session_id,
                    user = %session.db_user,
                    operation = %blocked_op,
                    "blocked_operation matched"
                );
                return PolicyResult::block(
                    "blocked-operation",
                    format!("Operation blocked for user '{}': {blocked_op}", session.db_user),
                );
            }
        }

        // Step 7: time restriction
        if let Some(tr) = &rule.time_restriction {
            let Some(range) = parse_time_range(&tr.allow_range) else {
                warn!(
                    session_id = session.session_id,
                    allow_range = %tr.allow_range,
                    "invalid time restriction, blocking"
                );
                return PolicyResult::block(
                    "time-restriction",
                    format!("Invalid time restriction configuration for user '{}'", session.db_user),
                );
            };
            match within_time_range(&range, &tr.timezone) {
                Some(true) => {}
                Some(false) => {
                    info!(
                        session_id = session.session_id,
                        user = %session.db_user,
                        allow_range = %tr.allow_range,
                        timezone = %tr.timezone,
                        "time restriction denied"
                    );
                    return PolicyResult::block("time-restriction", "Access outside allowed hours");
                }
                None => {
                    warn!(timezone = %tr.timezone, "timezone lookup failed, blocking");
                    return PolicyResult::block(
                        "time-restriction",
                        format!("Unknown timezone: {}", tr.timezone),
                    );
                }
            }
        }

        // Step 8: table allow-list
        let all_tables_allowed = rule.allowed_tables.iter().any(|t| t == "*");
        if !all_tables_allowed && !query.tables.is_empty() {
            for table in &query.tables {
                let allowed = rule
                    .allowed_tables
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(table));
                if !allowed {
                    info!(
                        session_id = session.session_id,
                        user = %session.db_user,
                        table = %table,
                        "table not in allowed_tables"
                    );
                    return PolicyResult::block(
                        "table-denied",
                        format!("Table access denied: {table}"),
                    );
                }
            }
        }

        // Step 9: operation allow-list
        if !rule.allowed_operations.is_empty() {
            let all_ops_allowed = rule.allowed_operations.iter().any(|op| op == "*");
            if !all_ops_allowed {
                let op_allowed = rule
                    .allowed_operations
                    .iter()
                    .any(|op| op.eq_ignore_ascii_case(cmd_str));
                if !op_allowed {
                    info!(
                        session_id = session.session_id,
                        user = %session.db_user,
                        operation = cmd_str,
                        "operation not in allowed_operations"
                    );
                    return PolicyResult::block(
                        "operation-denied",
                        format!("Operation not allowed: {cmd_str}"),
                    );
                }
            }
        }

        // Step 10: procedure control
        let pc = &config.procedure_control;
        match query.command {
            SqlCommand::Prepare | SqlCommand::Execute => {
                if pc.block_dynamic_sql {
                    info!(
                        session_id = session.session_id,
                        user = %session.db_user,
                        command = cmd_str,
                        "dynamic SQL blocked by procedure_control"
                    );
                    return PolicyResult::block(
                        "procedure-dynamic-sql",
                        format!("Dynamic SQL ({cmd_str}) blocked by policy"),
                    );
                }
            }
            SqlCommand::Call => {
                let proc_name = query.procedure_name.as_deref().unwrap_or("");
                let listed = pc.whitelist.iter().any(|p| p.eq_ignore_ascii_case(proc_name));
                if pc.mode == "whitelist" && !listed {
                    info!(
                        session_id = session.session_id,
                        user = %session.db_user,
                        procedure = proc_name,
                        "procedure not in whitelist"
                    );
                    return PolicyResult::block(
                        "procedure-whitelist",
                        format!("Procedure '{proc_name}' not in whitelist"),
                    );
                }
                if pc.mode == "blacklist" && listed {
                    info!(
                        session_id = session.session_id,
                        user = %session.db_user,
                        procedure = proc_name,
                        "procedure in blacklist"
                    );
                    return PolicyResult::block(
                        "procedure-blacklist",
                        format!("Procedure '{proc_name}' is blacklisted"),
                    );
                }
            }
            SqlCommand::Create | SqlCommand::Alter => {
                if pc.block_create_alter {
                    info!(
                        session_id = session.session_id,
                        user = %session.db_user,
                        command = cmd_str,
                        "blocked by procedure_control.block_create_alter"
                    );
                    return PolicyResult::block(
                        "procedure-create-alter",
                        format!("{cmd_str} blocked by procedure policy"),
                    );
                }
            }
            _ => {}
        }

        // Step 11: system schema access
        if config.data_protection.block_schema_access {
            const SCHEMA_NAMES: [&str; 4] =
                ["information_schema", "mysql", "performance_schema", "sys"];
            for table in &query.tables {
                if SCHEMA_NAMES.iter().any(|s| s.eq_ignore_ascii_case(table)) {
                    info!(
                        session_id = session.session_id,
                        user = %session.db_user,
                        table = %table,
                        "schema access blocked"
                    );
                    return PolicyResult::block("schema-access", "Schema access blocked");
                }
            }
        }

        // Step 12: explicit allow
        debug!(
            session_id = session.session_id,
            user = %session.db_user,
            command = cmd_str,
            "access allowed"
        );
        PolicyResult {
            action: PolicyAction::Allow,
            matched_rule: format!("access-rule:{}", rule.user),
            reason: "Access allowed".to_string(),
        }
    }
}

/// IPv4-only CIDR containment check.
///
/// Any parse failure in the CIDR string, prefix, or client IP (including an
/// IPv6 client) yields false; an unmatchable rule is safer than a
/// misparsed one.
fn ip_in_cidr(ip: &str, cidr: &str) -> bool {
    let Some((network_str, prefix_str)) = cidr.split_once('/') else {
        warn!(cidr, "invalid CIDR format (no '/')");
        return false;
    };

    let prefix: u32 = match prefix_str.parse() {
        Ok(p) if p <= 32 => p,
        _ => {
            warn!(cidr, "invalid prefix length in CIDR");
            return false;
        }
    };

    let Ok(client) = ip.parse::<Ipv4Addr>() else {
        debug!(ip, "cannot parse client IP as IPv4");
        return false;
    };
    let Ok(network) = network_str.parse::<Ipv4Addr>() else {
        warn!(cidr, "cannot parse network address in CIDR");
        return false;
    };

    let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    (u32::from(client) & mask) == (u32::from(network) & mask)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimeRange {
    start_minutes: u32,
    end_minutes: u32,
}

/// Parse "HH:MM-HH:MM".
fn parse_time_range(range: &str) -> Option<TimeRange> {
    // shortest acceptable form is "0:0-0:0"
    if range.len() < 7 {
        return None;
    }
    let dash = range[1..].find('-')? + 1;
    let start = parse_hhmm(&range[..dash])?;
    let end = parse_hhmm(&range[dash + 1..])?;
    Some(TimeRange {
        start_minutes: start,
        end_minutes: end,
    })
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let hour: u32 = h.trim().parse().ok()?;
    let min: u32 = m.trim().parse().ok()?;
    if hour > 23 || min > 59 {
        return None;
    }
    Some(hour * 60 + min)
}

/// A range with start > end wraps past midnight (22:00-06:00 admits 23:30
/// and 05:59 but not 12:00).
fn minutes_within(range: &TimeRange, now_minutes: u32) -> bool {
    if range.start_minutes <= range.end_minutes {
        now_minutes >= range.start_minutes && now_minutes < range.end_minutes
    } else {
        now_minutes >= range.start_minutes || now_minutes < range.end_minutes
    }
}

/// Evaluate the range in the named zone; None when the zone is unknown.
fn within_time_range(range: &TimeRange, tz_name: &str) -> Option<bool> {
    let tz: chrono_tz::Tz = if tz_name.is_empty() {
        chrono_tz::UTC
    } else {
        tz_name.parse().ok()?
    };
    let now = chrono::Utc::now().with_timezone(&tz);
    Some(minutes_within(range, now.hour() * 60 + now.minute()))
}
