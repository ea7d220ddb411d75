//! Operation classification
//!
//! Decides whether a call is a plain read, a write, a transaction, or
//! something the proxy cannot judge.

/// Methods that write and must pin the session to the primary
pub const STICKY_WRITES: &[&str] = &["delete", "delete_all", "insert", "update", "update_all"];

/// Methods that only read
pub const NON_STICKY_READS: &[&str] = &["sanitize_limit", "select", "select_one", "quote_column_name"];

/// What a proxied call does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Plain read, may run on a replica
    Read,
    /// Write, runs on the primary and pins the session
    Write,
    /// Transaction block
    Transaction,
    /// Anything else, runs on the primary unless the session allows
    /// ambiguous queries on replicas
    Unknown,
}

impl Operation {
    /// Classify a call by method name
    pub fn for_method(name: &str) -> Self {
        if STICKY_WRITES.contains(&name) {
            Operation::Write
        } else if NON_STICKY_READS.contains(&name) {
            Operation::Read
        } else if name == "transaction" {
            Operation::Transaction
        } else {
            Operation::Unknown
        }
    }

    /// Classify a raw SQL statement. Locking selects count as writes.
    /// `BEGIN` and `START TRANSACTION` are unknown: only a transaction
    /// block tracks nesting, a bare statement cannot.
    pub fn for_sql(sql: &str) -> Self {
        let statement = strip_leading_comments(sql);
        let keyword = statement
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or("")
            .to_uppercase();

        match keyword.as_str() {
            "SELECT" if takes_lock(statement) => Operation::Write,
            "SELECT" => Operation::Read,
            "INSERT" | "UPDATE" | "DELETE" | "REPLACE" => Operation::Write,
            _ => Operation::Unknown,
        }
    }

    pub fn is_write(self) -> bool {
        self == Operation::Write
    }
}

/// `SELECT ... FOR UPDATE` or `SELECT ... LOCK IN SHARE MODE`
fn takes_lock(statement: &str) -> bool {
    let words: Vec<String> = statement
        .split_whitespace()
        .map(|w| w.trim_end_matches(';').to_uppercase())
        .collect();

    words.windows(2).any(|w| w[0] == "FOR" && w[1] == "UPDATE")
        || words
            .windows(4)
            .any(|w| w[0] == "LOCK" && w[1] == "IN" && w[2] == "SHARE" && w[3] == "MODE")
}

/// Skip `/* */`, `--` and `#` comments before the statement
fn strip_leading_comments(query: &str) -> &str {
    let mut s = query.trim();
    loop {
        if s.starts_with("/*") {
            if let Some(end) = s.find("*/") {
                s = s[end + 2..].trim_start();
                continue;
            }
        }
        if s.starts_with("--") || s.starts_with('#') {
            if let Some(end) = s.find('\n') {
                s = s[end + 1..].trim_start();
                continue;
            }
        }
        break;
    }
    s
}
