use serde::{Deserialize, Serialize};

/// High-level enumeration switches translated into the wrapped tool's
/// argument list. Field names follow sqlmap's flag vocabulary; the builder
/// itself stays a pure function of its inputs so it can be tested without
/// spawning anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnumerationOptions {
    pub dbs: bool,
    pub tables: bool,
    pub columns: bool,
    pub dump: bool,
    pub dump_all: bool,
    pub users: bool,
    pub passwords: bool,
    pub roles: bool,
    pub selected_db: Option<String>,
    pub selected_table: Option<String>,
    pub risk: Option<u8>,
    pub level: Option<u8>,
    pub threads: Option<u32>,
    /// Raw passthrough arguments appended last; their syntax belongs to the
    /// wrapped tool, not to us.
    pub extra: Vec<String>,
}

impl EnumerationOptions {
    /// Builds the argument list handed to the tool after the target.
    /// Always batches so the tool never blocks on interactive prompts.
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["--batch".into(), "--answers=follow=Y".into()];

        if let Some(risk) = self.risk {
            args.push("--risk".into());
            args.push(risk.to_string());
        }
        if let Some(level) = self.level {
            args.push("--level".into());
            args.push(level.to_string());
        }
        if let Some(threads) = self.threads {
            args.push("--threads".into());
            args.push(threads.to_string());
        }

        if self.dbs {
            args.push("--dbs".into());
        }

        if self.tables {
            args.push("--tables".into());
            if let Some(db) = &self.selected_db {
                args.push("-D".into());
                args.push(db.clone());
            }
        }

        if self.columns {
            if let Some(db) = &self.selected_db {
                args.push("-D".into());
                args.push(db.clone());
            }
            args.push("--columns".into());
            if let Some(table) = &self.selected_table {
                args.push("-T".into());
                args.push(table.clone());
            }
        }

        if self.users {
            args.push("--users".into());
        }
        if self.passwords {
            args.push("--passwords".into());
        }
        if self.roles {
            args.push("--roles".into());
        }

        if self.dump_all {
            args.push("--dump-all".into());
        } else if self.dump {
            if let Some(db) = &self.selected_db {
                args.push("-D".into());
                args.push(db.clone());
            }
            args.push("--dump".into());
            if let Some(table) = &self.selected_table {
                args.push("-T".into());
                args.push(table.clone());
            }
        }

        args.extend(self.extra.iter().cloned());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains_seq(args: &[String], seq: &[&str]) -> bool {
        if seq.is_empty() {
            return true;
        }
        args.windows(seq.len()).any(|w| w.iter().zip(seq).all(|(a, b)| a == b))
    }

    #[test]
    fn test_default_always_batches() {
        let args = EnumerationOptions::default().to_args();
        assert_eq!(args, vec!["--batch", "--answers=follow=Y"]);
    }

    #[test]
    fn test_dbs_flag() {
        let opts = EnumerationOptions { dbs: true, ..Default::default() };
        assert!(opts.to_args().contains(&"--dbs".to_string()));
    }

    #[test]
    fn test_tables_with_selected_db() {
        let opts = EnumerationOptions {
            tables: true,
            selected_db: Some("dvwa".into()),
            ..Default::default()
        };
        assert!(contains_seq(&opts.to_args(), &["--tables", "-D", "dvwa"]));
    }

    #[test]
    fn test_tables_without_db_still_requested() {
        let opts = EnumerationOptions { tables: true, ..Default::default() };
        let args = opts.to_args();
        assert!(args.contains(&"--tables".to_string()));
        assert!(!args.contains(&"-D".to_string()));
    }

    #[test]
    fn test_columns_with_db_and_table() {
        let opts = EnumerationOptions {
            columns: true,
            selected_db: Some("dvwa".into()),
            selected_table: Some("users".into()),
            ..Default::default()
        };
        assert!(contains_seq(&opts.to_args(), &["-D", "dvwa", "--columns", "-T", "users"]));
    }

    #[test]
    fn test_dump_all_wins_over_dump() {
        let opts = EnumerationOptions { dump: true, dump_all: true, ..Default::default() };
        let args = opts.to_args();
        assert!(args.contains(&"--dump-all".to_string()));
        assert!(!args.contains(&"--dump".to_string()));
    }

    #[test]
    fn test_risk_level_threads() {
        let opts = EnumerationOptions {
            risk: Some(3),
            level: Some(5),
            threads: Some(4),
            ..Default::default()
        };
        let args = opts.to_args();
        assert!(contains_seq(&args, &["--risk", "3"]));
        assert!(contains_seq(&args, &["--level", "5"]));
        assert!(contains_seq(&args, &["--threads", "4"]));
    }

    #[test]
    fn test_extra_args_appended_last() {
        let opts = EnumerationOptions {
            dbs: true,
            extra: vec!["--cookie".into(), "PHPSESSID=abc".into()],
            ..Default::default()
        };
        let args = opts.to_args();
        assert_eq!(args[args.len() - 2..], ["--cookie".to_string(), "PHPSESSID=abc".to_string()]);
    }
}
