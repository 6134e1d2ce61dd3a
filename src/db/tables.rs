//! Naming convention for the tenant-scoped tables.
//!
//! Tenant schemas are provisioned outside this service, one set of tables per
//! scope. Every SQL identifier the store uses comes from [`TableName`]; nothing
//! else builds table names, and ids are the only variable parts.

use crate::models::scope::{BankId, Scope, SubsiteId, TenantId};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TableKind {
    /// `sensor_id, is_fetching, is_sending`
    Control,
    /// Registered sensors with their schedule settings.
    Sensors,
    /// Source endpoint per bank id.
    Endpoints,
    /// Per-scope sensor log lines.
    Logs,
}

impl TableKind {
    fn prefix(self) -> &'static str {
        match self {
            TableKind::Control => "interval_control",
            TableKind::Sensors => "active_sensors",
            TableKind::Endpoints => "sensor_apis",
            TableKind::Logs => "sensor_logs",
        }
    }
}

const DATA_PREFIX: &str = "sensor_data";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
    pub fn for_scope(kind: TableKind, scope: &Scope) -> Self {
        TableName(format!("{}_{}", kind.prefix(), scope_suffix(scope)))
    }

    /// Per-sensor data table.
    pub fn data(scope: &Scope, bank_id: BankId) -> Self {
        TableName(format!("{}_{}_{}", DATA_PREFIX, scope_suffix(scope), bank_id.0))
    }

    /// Name reported back by the database, e.g. in an undefined-table error.
    pub(crate) fn from_catalog(name: &str) -> Self {
        TableName(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted identifier, safe to splice into SQL text.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0.replace('"', "\"\""))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn scope_suffix(scope: &Scope) -> String {
    match scope {
        Scope::Tenant(t) => t.0.to_string(),
        Scope::Subsite(t, s) => format!("{}_{}", t.0, s.0),
    }
}

/// `LIKE` pattern matching every control table.
pub fn control_table_pattern() -> String {
    format!("{}\\_%", TableKind::Control.prefix().replace('_', "\\_"))
}

/// Recover the scope from a control table name, ignoring anything that does
/// not follow the convention exactly.
pub fn scope_from_control_table(name: &str) -> Option<Scope> {
    let rest = name.strip_prefix(TableKind::Control.prefix())?.strip_prefix('_')?;
    let mut parts = rest.split('_');
    let tenant = parse_id(parts.next()?)?;
    let scope = match parts.next() {
        None => Scope::Tenant(TenantId(tenant)),
        Some(sub) => Scope::Subsite(TenantId(tenant), SubsiteId(parse_id(sub)?)),
    };
    if parts.next().is_some() {
        return None;
    }
    Some(scope)
}

fn parse_id(raw: &str) -> Option<i64> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_convention() {
        let tenant = Scope::tenant(12);
        let subsite = Scope::subsite(12, 3);
        assert_eq!(TableName::for_scope(TableKind::Control, &tenant).as_str(), "interval_control_12");
        assert_eq!(TableName::for_scope(TableKind::Control, &subsite).as_str(), "interval_control_12_3");
        assert_eq!(TableName::for_scope(TableKind::Sensors, &subsite).as_str(), "active_sensors_12_3");
        assert_eq!(TableName::for_scope(TableKind::Logs, &tenant).as_str(), "sensor_logs_12");
        assert_eq!(TableName::data(&subsite, BankId(77)).as_str(), "sensor_data_12_3_77");
        assert_eq!(TableName::data(&tenant, BankId(77)).quoted(), "\"sensor_data_12_77\"");
    }

    #[test]
    fn control_tables_round_trip_to_scopes() {
        for scope in [Scope::tenant(1), Scope::subsite(1, 7), Scope::subsite(2, 8)] {
            let name = TableName::for_scope(TableKind::Control, &scope);
            assert_eq!(scope_from_control_table(name.as_str()), Some(scope));
        }
    }

    #[test]
    fn foreign_tables_are_ignored() {
        for name in [
            "interval_control",
            "interval_control_",
            "interval_control_x",
            "interval_control_1_2_3",
            "interval_control_1__2",
            "interval_control_-1",
            "interval_controls_1",
            "active_sensors_1",
        ] {
            assert_eq!(scope_from_control_table(name), None, "{name}");
        }
    }

    #[test]
    fn like_pattern_escapes_underscores() {
        assert_eq!(control_table_pattern(), "interval\\_control\\_%");
    }
}
