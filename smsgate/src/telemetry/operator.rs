use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::parse::{Strategy, first_match, group, strategy};

/// `<mode>` of `+COPS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SelectionMode {
    Automatic,
    Manual,
    Deregister,
    SetFormat,
    ManualAutomatic,
    Unknown(u8),
}

impl SelectionMode {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Automatic,
            1 => Self::Manual,
            2 => Self::Deregister,
            3 => Self::SetFormat,
            4 => Self::ManualAutomatic,
            other => Self::Unknown(other),
        }
    }
}

/// `<AcT>` of `+COPS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessTechnology {
    Gsm,
    GsmCompact,
    Utran,
    GsmEgprs,
    UtranHsdpa,
    UtranHsupa,
    UtranHsdpaHsupa,
    EUtran,
    Unknown(u8),
}

impl AccessTechnology {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Gsm,
            1 => Self::GsmCompact,
            2 => Self::Utran,
            3 => Self::GsmEgprs,
            4 => Self::UtranHsdpa,
            5 => Self::UtranHsupa,
            6 => Self::UtranHsdpaHsupa,
            7 => Self::EUtran,
            other => Self::Unknown(other),
        }
    }
}

/// One `AT+COPS?` answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorSample {
    pub timestamp: DateTime<Utc>,
    pub mode: SelectionMode,
    /// `<format>`: 0 long name, 1 short name, 2 numeric code.
    pub format: Option<u8>,
    pub operator: Option<String>,
    pub technology: Option<AccessTechnology>,
}

#[derive(Debug, Clone, PartialEq)]
struct Fields {
    mode: u8,
    format: Option<u8>,
    operator: Option<String>,
    technology: Option<u8>,
}

fn full(c: &regex::Captures<'_>) -> Option<Fields> {
    Some(Fields {
        mode: group(c, 1)?,
        format: group(c, 2),
        operator: c.get(3).map(|m| m.as_str().to_owned()),
        technology: group(c, 4),
    })
}

static STRATEGIES: [Strategy<Fields>; 4] = [
    strategy!(
        "quoted with technology",
        r#"\+COPS:\s*(\d+),(\d+),"([^"]*)",(\d+)"#,
        full
    ),
    strategy!("quoted", r#"\+COPS:\s*(\d+),(\d+),"([^"]*)""#, full),
    strategy!("bare", r#"\+COPS:\s*(\d+),(\d+),([^,\s"]+)(?:,(\d+))?"#, full),
    strategy!("mode only", r"\+COPS:\s*(\d+)", |c| {
        Some(Fields {
            mode: group(c, 1)?,
            format: None,
            operator: None,
            technology: None,
        })
    }),
];

pub fn parse_operator(text: &str, timestamp: DateTime<Utc>) -> Option<OperatorSample> {
    let (_, fields) = first_match(&STRATEGIES, text)?;
    Some(OperatorSample {
        timestamp,
        mode: SelectionMode::from_code(fields.mode),
        format: fields.format,
        operator: fields.operator,
        technology: fields.technology.map(AccessTechnology::from_code),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> OperatorSample {
        parse_operator(text, Utc::now()).unwrap()
    }

    #[test]
    fn it_parses_every_field() {
        let sample = parse("\r\n+COPS: 0,0,\"Orange F\",3\r\n\r\nOK\r\n");
        assert_eq!(sample.mode, SelectionMode::Automatic);
        assert_eq!(sample.format, Some(0));
        assert_eq!(sample.operator.as_deref(), Some("Orange F"));
        assert_eq!(sample.technology, Some(AccessTechnology::GsmEgprs));
    }

    #[test]
    fn it_tolerates_missing_trailing_fields() {
        let sample = parse("+COPS: 1,0,\"T-Mobile\"");
        assert_eq!(sample.mode, SelectionMode::Manual);
        assert_eq!(sample.technology, None);

        let sample = parse("+COPS: 0,2,46000");
        assert_eq!(sample.operator.as_deref(), Some("46000"));
        assert_eq!(sample.technology, None);

        let sample = parse("+COPS: 0,2,46000,7");
        assert_eq!(sample.technology, Some(AccessTechnology::EUtran));

        let sample = parse("+COPS: 2");
        assert_eq!(sample.mode, SelectionMode::Deregister);
        assert_eq!(sample.operator, None);
    }

    #[test]
    fn it_keeps_unknown_codes() {
        assert!(matches!(SelectionMode::from_code(9), SelectionMode::Unknown(9)));
        assert!(matches!(
            AccessTechnology::from_code(12),
            AccessTechnology::Unknown(12)
        ));
        assert!(parse_operator("OK", Utc::now()).is_none());
    }
}
