use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;

use super::{SmsRecord, SmsStatus};
use crate::parse::split_quoted_fields;

static CMTI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\+CMTI:\s*"([^"]*)"\s*,\s*(\d+)"#).unwrap());

static CMGS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\+CMGS:\s*(\d+)").unwrap());

/// Storage and slot of a `+CMTI: "SM",7` notice.
pub fn parse_new_message_notice(line: &str) -> Option<(String, u32)> {
    let captures = CMTI_RE.captures(line)?;
    let slot = captures[2].parse().ok()?;
    Some((captures[1].to_owned(), slot))
}

/// Message reference of a `+CMGS: 12` confirmation.
pub fn parse_send_reference(raw: &str) -> Option<u32> {
    CMGS_RE.captures(raw)?[1].parse().ok()
}

/// Lines of a read or list answer up to its final `OK`. Message text may
/// contain `OK` lines of its own, only the last one ends the answer.
fn text_lines(raw: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = raw.lines().map(|line| line.trim_end_matches('\r')).collect();
    if let Some(end) = lines.iter().rposition(|line| line.trim() == "OK") {
        lines.truncate(end);
    }
    lines
}

fn finish_body(mut lines: Vec<&str>) -> String {
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// `<stat>,<oa>[,<alpha>],<scts>`, as found after `+CMGR:` and after the
/// index of `+CMGL:`.
fn header(fields: &[String]) -> Option<(SmsStatus, String, String)> {
    let status = SmsStatus::parse(fields.first()?);
    let sender = fields.get(1)?.clone();
    let timestamp = match fields.len() {
        0..=2 => String::new(),
        3 => fields[2].clone(),
        _ => fields[3].clone(),
    };
    Some((status, sender, timestamp))
}

/// Reads an `AT+CMGR=<slot>` answer. `None` when the header is missing or
/// malformed.
pub fn parse_read(raw: &str, slot: u32) -> Option<SmsRecord> {
    let mut lines = text_lines(raw).into_iter();
    let header_line = lines.find(|line| line.trim_start().starts_with("+CMGR:"))?;
    let fields = split_quoted_fields(header_line.trim_start()["+CMGR:".len()..].trim());
    let (status, sender, timestamp) = header(&fields)?;

    let body = lines.collect();

    Some(SmsRecord {
        slot: Some(slot),
        status,
        sender,
        timestamp,
        body: finish_body(body),
        received_at: Utc::now(),
    })
}

/// Reassembles the header/body pairs of an `AT+CMGL` answer, in order.
/// Entries whose header does not parse are skipped.
pub fn parse_list(raw: &str) -> Vec<SmsRecord> {
    let mut records = Vec::new();
    let mut current: Option<(SmsRecord, Vec<&str>)> = None;

    for line in text_lines(raw) {
        if let Some(rest) = line.trim_start().strip_prefix("+CMGL:") {
            if let Some((record, body)) = current.take() {
                records.push(SmsRecord {
                    body: finish_body(body),
                    ..record
                });
            }
            let fields = split_quoted_fields(rest.trim());
            let slot = fields.first().and_then(|index| index.parse().ok());
            current = slot.zip(header(&fields[1..])).map(|(slot, (status, sender, timestamp))| {
                let record = SmsRecord {
                    slot: Some(slot),
                    status,
                    sender,
                    timestamp,
                    body: String::new(),
                    received_at: Utc::now(),
                };
                (record, Vec::new())
            });
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((record, body)) = current {
        records.push(SmsRecord {
            body: finish_body(body),
            ..record
        });
    }

    records
}

/// Builds a record from a directly delivered `+CMT:` header and its body.
pub fn parse_delivered(header_line: &str, body: &str) -> Option<SmsRecord> {
    let rest = header_line.trim().strip_prefix("+CMT:")?;
    let fields = split_quoted_fields(rest.trim());
    let sender = fields.first().filter(|sender| !sender.is_empty())?.clone();
    let timestamp = fields.get(2).or(fields.get(1)).cloned().unwrap_or_default();

    Some(SmsRecord {
        slot: None,
        status: SmsStatus::Unread,
        sender,
        timestamp,
        body: body.to_owned(),
        received_at: Utc::now(),
    })
}
