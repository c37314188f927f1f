use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::amount::ParseAmountError;
use crate::engine::WalletAudit;
use crate::model::{ProviderStatus, UserId};
use crate::replay::Command;

/// Errors that can occur when reading or writing csv files
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized event type '{row_type}'")]
    UnrecognizedType { line: usize, row_type: String },

    #[error("line {line}: {row_type} missing {field}")]
    MissingField {
        line: usize,
        row_type: String,
        field: &'static str,
    },

    #[error("line {line}: {source}")]
    InvalidValue {
        line: usize,
        source: ParseAmountError,
    },

    #[error("failed to write row: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush output: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    user: Option<String>,
    r#ref: Option<String>,
    amount: Option<String>,
    liters: Option<String>,
    status: Option<String>,
    event: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    user: &'a str,
    balance: String,
    ledger_sum: String,
    consistent: bool,
}

/// Fields of one input row, with empty cells treated as absent
struct Row {
    line: usize,
    row_type: String,
    user: Option<String>,
    reference: Option<String>,
    amount: Option<String>,
    liters: Option<String>,
    status: Option<String>,
    event: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl Row {
    fn new(line: usize, input: InputRow) -> Self {
        Self {
            line,
            row_type: input.r#type.to_ascii_lowercase(),
            user: non_empty(input.user),
            reference: non_empty(input.r#ref),
            amount: non_empty(input.amount),
            liters: non_empty(input.liters),
            status: non_empty(input.status),
            event: non_empty(input.event),
        }
    }

    fn require(&self, value: &Option<String>, field: &'static str) -> Result<String, CsvError> {
        value.clone().ok_or_else(|| CsvError::MissingField {
            line: self.line,
            row_type: self.row_type.clone(),
            field,
        })
    }

    fn parse<T: std::str::FromStr<Err = ParseAmountError>>(
        &self,
        raw: &str,
    ) -> Result<T, CsvError> {
        raw.parse().map_err(|source| CsvError::InvalidValue {
            line: self.line,
            source,
        })
    }

    fn into_command(self) -> Result<Command, CsvError> {
        match self.row_type.as_str() {
            "open" => Ok(Command::Open {
                user: UserId::new(self.require(&self.user, "user")?),
                alias: self.require(&self.reference, "ref")?,
                amount: self.parse(&self.require(&self.amount, "amount")?)?,
            }),
            "provider" => Ok(Command::Provider {
                alias: self.require(&self.reference, "ref")?,
                status: ProviderStatus::parse(&self.require(&self.status, "status")?),
            }),
            "webhook" => Ok(Command::Webhook {
                alias: self.require(&self.reference, "ref")?,
                event_id: self.require(&self.event, "event")?,
                status: ProviderStatus::parse(&self.require(&self.status, "status")?),
                amount: self
                    .amount
                    .as_deref()
                    .map(|raw| self.parse(raw))
                    .transpose()?,
            }),
            "recheck" => Ok(Command::Recheck {
                user: self.user.clone().map(UserId::new),
                alias: self.require(&self.reference, "ref")?,
            }),
            "sweep" => Ok(Command::Sweep {
                user: self.user.clone().map(UserId::new),
            }),
            "dispense" => Ok(Command::Dispense {
                user: UserId::new(self.require(&self.user, "user")?),
                liters: self.parse(&self.require(&self.liters, "liters")?)?,
                machine: self.reference.clone(),
            }),
            other => Err(CsvError::UnrecognizedType {
                line: self.line,
                row_type: other.to_string(),
            }),
        }
    }
}

/// Read replay commands from a csv file with the header
/// `type,user,ref,amount,liters,status,event`
pub fn read_commands(
    path: &Path,
) -> Result<impl Iterator<Item = Result<Command, CsvError>> + use<>, CsvError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let input = result.map_err(|source| CsvError::Parse { line, source })?;
            Row::new(line, input).into_command()
        }))
}

/// Write wallet audits in csv format
pub fn write_wallets<'a>(
    out: impl io::Write,
    audits: impl IntoIterator<Item = &'a WalletAudit>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(out);

    for audit in audits {
        writer.serialize(OutputRow {
            user: audit.user_id.as_str(),
            balance: audit.balance.to_string(),
            ledger_sum: audit.ledger_sum.to_string(),
            consistent: audit.consistent,
        })?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::{Cents, Liters};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "type,user,ref,amount,liters,status,event\n";

    fn write_csv(rows: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(HEADER.as_bytes()).unwrap();
        file.write_all(rows.as_bytes()).unwrap();
        file
    }

    fn read_all(rows: &str) -> Vec<Result<Command, CsvError>> {
        let file = write_csv(rows);
        read_commands(file.path()).unwrap().collect()
    }

    #[test]
    fn read_open() {
        let results = read_all("open, alice ,r1,100.50,,,\n");
        assert_eq!(results.len(), 1);

        match results.into_iter().next().unwrap().unwrap() {
            Command::Open {
                user,
                alias,
                amount,
            } => {
                assert_eq!(user, UserId::new("alice"));
                assert_eq!(alias, "r1");
                assert_eq!(amount, Cents::new(10_050));
            }
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test]
    fn read_webhook_with_optional_amount() {
        let results = read_all(
            "webhook,,r1,,,succeeded,evt_1\n\
             webhook,,r1,99.00,,canceled,evt_2\n",
        );
        let commands: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            commands[0],
            Command::Webhook {
                alias: "r1".into(),
                event_id: "evt_1".into(),
                status: ProviderStatus::Succeeded,
                amount: None,
            }
        );
        assert_eq!(
            commands[1],
            Command::Webhook {
                alias: "r1".into(),
                event_id: "evt_2".into(),
                status: ProviderStatus::Canceled,
                amount: Some(Cents::new(9_900)),
            }
        );
    }

    #[test]
    fn read_dispense_and_sweep() {
        let results = read_all(
            "dispense,bob,AQ-001,,10,,\n\
             sweep,,,,,,\n\
             sweep,bob,,,,,\n",
        );
        let commands: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            commands[0],
            Command::Dispense {
                user: UserId::new("bob"),
                liters: Liters::whole(10),
                machine: Some("AQ-001".into()),
            }
        );
        assert_eq!(commands[1], Command::Sweep { user: None });
        assert_eq!(
            commands[2],
            Command::Sweep {
                user: Some(UserId::new("bob"))
            }
        );
    }

    #[test]
    fn bad_rows_report_their_line() {
        let results = read_all(
            "refund,alice,r1,10.00,,,\n\
             open,alice,r1,,,,\n\
             open,alice,r1,ten,,,\n\
             dispense,alice,,,2.55,,\n\
             open,alice,r2,10.00,,,\n",
        );
        assert_eq!(results.len(), 5);
        assert!(matches!(
            results[0],
            Err(CsvError::UnrecognizedType { line: 2, .. })
        ));
        assert!(matches!(
            results[1],
            Err(CsvError::MissingField {
                line: 3,
                field: "amount",
                ..
            })
        ));
        assert!(matches!(
            results[2],
            Err(CsvError::InvalidValue { line: 4, .. })
        ));
        assert!(matches!(
            results[3],
            Err(CsvError::InvalidValue { line: 5, .. })
        ));
        assert!(results[4].is_ok());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            read_commands(Path::new("/nonexistent/events.csv")),
            Err(CsvError::Open { .. })
        ));
    }

    #[test]
    fn write_wallet_rows() {
        let audits = vec![
            WalletAudit {
                user_id: UserId::new("alice"),
                balance: Cents::new(6_500),
                ledger_sum: Cents::new(6_500),
                consistent: true,
            },
            WalletAudit {
                user_id: UserId::new("bob"),
                balance: Cents::ZERO,
                ledger_sum: Cents::new(5),
                consistent: false,
            },
        ];
        let mut out = Vec::new();
        write_wallets(&mut out, &audits).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "user,balance,ledger_sum,consistent\n\
             alice,65.00,65.00,true\n\
             bob,0.00,0.05,false\n"
        );
    }
}
