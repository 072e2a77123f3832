//! Unsolicited result codes: lines the modem pushes on its own, interleaved
//! with command responses on the same stream.

use tracing::warn;

/// One unsolicited push, still in its raw textual form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Urc {
    /// `+CMTI: "SM",7`, a message was stored in a slot.
    MessageStored(String),
    /// `+CMT: "+100","","24/01/01,12:00:00+08"` followed by the body line.
    MessageDelivered { header: String, body: String },
    /// `+CREG: 2`, the short form pushed after `AT+CREG=1`.
    Registration(String),
    /// A push cut off before its line ended. Its fields cannot be trusted.
    Incomplete(String),
}

/// Longest unterminated line kept between feeds.
const MAX_PARTIAL: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Stored,
    DeliveredHeader,
    Registration,
    Other,
}

fn classify(line: &str) -> LineKind {
    if line.starts_with("+CMTI:") {
        LineKind::Stored
    } else if line.starts_with("+CMT:") {
        LineKind::DeliveredHeader
    } else if let Some(fields) = line.strip_prefix("+CREG:") {
        // `+CREG: <n>,<stat>` answers a query, the push carries only the
        // status, optionally followed by quoted location fields.
        let fields: Vec<&str> = fields.split(',').map(str::trim).collect();
        match fields.as_slice() {
            [_] => LineKind::Registration,
            [_, second, ..] if second.starts_with('"') => LineKind::Registration,
            _ => LineKind::Other,
        }
    } else {
        LineKind::Other
    }
}

fn is_record_header(line: &str) -> bool {
    line.starts_with("+CMGR:") || line.starts_with("+CMGL:")
}

fn is_final_result(line: &str) -> bool {
    line == "OK" || line == "ERROR"
}

/// Pulls unsolicited lines out of `text`, returning what is left and the
/// pushes found. Incomplete trailing lines are never treated as pushes.
///
/// Stored message text is left alone: from the first `+CMGR:`/`+CMGL:`
/// header up to the last final result line nothing is salvaged.
pub fn split_unsolicited(text: &str) -> (String, Vec<Urc>) {
    let segments: Vec<&str> = text.split_inclusive('\n').collect();
    let records = segments
        .iter()
        .position(|segment| is_record_header(segment.trim()))
        .map(|start| {
            let end = segments
                .iter()
                .rposition(|segment| is_final_result(segment.trim()))
                .filter(|end| *end > start)
                .unwrap_or(segments.len());
            start..end
        });

    let mut kept = String::with_capacity(text.len());
    let mut found = Vec::new();
    let mut i = 0;
    while i < segments.len() {
        let segment = segments[i];
        i += 1;
        if records.as_ref().is_some_and(|records| records.contains(&(i - 1))) {
            kept.push_str(segment);
            continue;
        }

        let complete = segment.ends_with('\n');
        let line = segment.trim();
        match (complete, classify(line)) {
            (true, LineKind::Stored) => found.push(Urc::MessageStored(line.to_owned())),
            (true, LineKind::Registration) => {
                found.push(Urc::Registration(line.to_owned()))
            }
            (true, LineKind::DeliveredHeader)
                if segments.get(i).is_some_and(|next| next.ends_with('\n')) =>
            {
                let body = segments[i].trim().to_owned();
                i += 1;
                found.push(Urc::MessageDelivered {
                    header: line.to_owned(),
                    body,
                });
            }
            _ => kept.push_str(segment),
        }
    }

    (kept, found)
}

/// Line assembler for the raw byte stream the listener samples. Keeps
/// partial lines and a `+CMT` header waiting for its body across feeds.
#[derive(Debug, Default)]
pub struct UrcScanner {
    partial: Vec<u8>,
    pending_header: Option<String>,
}

impl UrcScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds freshly drained bytes and returns the pushes they completed.
    /// Lines that are not pushes land in `stray`.
    pub fn feed(&mut self, bytes: &[u8], stray: &mut Vec<String>) -> Vec<Urc> {
        self.partial.extend_from_slice(bytes);
        let mut found = Vec::new();

        while let Some(end) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_owned();

            if let Some(header) = self.pending_header.take() {
                found.push(Urc::MessageDelivered { header, body: line });
                continue;
            }
            if line.is_empty() {
                continue;
            }
            match classify(&line) {
                LineKind::Stored => found.push(Urc::MessageStored(line)),
                LineKind::Registration => found.push(Urc::Registration(line)),
                LineKind::DeliveredHeader => self.pending_header = Some(line),
                LineKind::Other => stray.push(line),
            }
        }

        if self.partial.len() > MAX_PARTIAL {
            let line = String::from_utf8_lossy(&self.partial).into_owned();
            warn!(len = self.partial.len(), "unterminated line too long, dropping it");
            self.partial.clear();
            stray.push(line);
        }

        found
    }

    /// Closes off whatever is still unterminated. A push that was cut off
    /// comes back as [`Urc::Incomplete`].
    pub fn finish(&mut self, stray: &mut Vec<String>) -> Vec<Urc> {
        let rest = String::from_utf8_lossy(&self.partial).trim().to_owned();
        self.partial.clear();
        let mut found = Vec::new();

        if let Some(header) = self.pending_header.take() {
            found.push(Urc::Incomplete(header));
            if !rest.is_empty() {
                stray.push(rest);
            }
            return found;
        }
        match classify(&rest) {
            _ if rest.is_empty() => {}
            LineKind::Other => stray.push(rest),
            _ => found.push(Urc::Incomplete(rest)),
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_tells_registration_pushes_from_query_answers() {
        assert_eq!(classify("+CREG: 2"), LineKind::Registration);
        assert_eq!(classify("+CREG: 1,\"00C3\",\"1A2B\""), LineKind::Registration);
        assert_eq!(classify("+CREG: 1,5"), LineKind::Other);
        assert_eq!(classify("+CMTI: \"SM\",7"), LineKind::Stored);
        assert_eq!(classify("+CMGR: \"REC UNREAD\""), LineKind::Other);
    }

    #[test]
    fn it_salvages_pushes_from_a_response() {
        let text = "\r\n+CMTI: \"SM\",3\r\n\r\n+CSQ: 15,99\r\n\r\nOK\r\n";
        let (kept, found) = split_unsolicited(text);
        assert_eq!(found, [Urc::MessageStored("+CMTI: \"SM\",3".into())]);
        assert_eq!(kept, "\r\n\r\n+CSQ: 15,99\r\n\r\nOK\r\n");
    }

    #[test]
    fn it_keeps_the_query_answer_in_the_response() {
        let (kept, found) = split_unsolicited("\r\n+CREG: 1,1\r\n\r\nOK\r\n");
        assert!(found.is_empty());
        assert!(kept.contains("+CREG: 1,1"));
    }

    #[test]
    fn it_pairs_direct_delivery_with_its_body() {
        let (kept, found) =
            split_unsolicited("\r\n+CMT: \"+100\",\"\",\"24/01/01,10:00:00+00\"\r\nhey\r\n");
        assert_eq!(kept, "\r\n");
        assert_eq!(
            found,
            [Urc::MessageDelivered {
                header: "+CMT: \"+100\",\"\",\"24/01/01,10:00:00+00\"".into(),
                body: "hey".into()
            }]
        );
    }

    #[test]
    fn it_waits_for_complete_lines_across_feeds() {
        let mut scanner = UrcScanner::new();
        let mut stray = Vec::new();
        assert!(scanner.feed(b"\r\n+CMTI: \"SM\"", &mut stray).is_empty());
        let found = scanner.feed(b",12\r\n\r\n+CMT: \"+1\",\"\",\"ts\"\r\n", &mut stray);
        assert_eq!(found, [Urc::MessageStored("+CMTI: \"SM\",12".into())]);
        let found = scanner.feed("b\u{f6}dy text\r\nRING\r\n".as_bytes(), &mut stray);
        assert_eq!(
            found,
            [Urc::MessageDelivered {
                header: "+CMT: \"+1\",\"\",\"ts\"".into(),
                body: "b\u{f6}dy text".into()
            }]
        );
        assert_eq!(stray, ["RING"]);
    }

    #[test]
    fn it_leaves_stored_message_text_alone() {
        let text = "\r\n+CMTI: \"SM\",9\r\n\
                    \r\n+CMGL: 1,\"REC READ\",\"+100\",\"\",\"ts\"\r\n+CMTI: \"SM\",5\
                    \r\n+CMGL: 2,\"REC READ\",\"+200\",\"\",\"ts\"\r\n+CREG: 1\
                    \r\n+CMGL: 3,\"REC READ\",\"+300\",\"\",\"ts\"\r\nOK\
                    \r\n\r\nOK\r\n+CREG: 5\r\n";
        let (kept, found) = split_unsolicited(text);
        assert_eq!(
            found,
            [
                Urc::MessageStored("+CMTI: \"SM\",9".into()),
                Urc::Registration("+CREG: 5".into())
            ]
        );
        assert!(kept.contains("\r\n+CMTI: \"SM\",5\r\n"));
        assert!(kept.contains("\r\n+CREG: 1\r\n"));
        assert!(kept.ends_with("\r\nOK\r\n\r\nOK\r\n"));
    }

    #[test]
    fn it_salvages_nothing_from_an_unterminated_record() {
        let text = "\r\n+CMGR: \"REC UNREAD\",\"+1\",\"\",\"ts\"\r\n+CMT: \"+2\",\"\",\"ts\"\r\nhi\r\n";
        let (kept, found) = split_unsolicited(text);
        assert!(found.is_empty());
        assert_eq!(kept, text);
    }

    #[test]
    fn it_closes_off_cut_pushes() {
        let mut scanner = UrcScanner::new();
        let mut stray = Vec::new();
        assert!(scanner.feed(b"\r\n+CMTI: \"SM\",1", &mut stray).is_empty());
        assert_eq!(
            scanner.finish(&mut stray),
            [Urc::Incomplete("+CMTI: \"SM\",1".into())]
        );
        assert!(scanner.finish(&mut stray).is_empty());

        scanner.feed(b"\r\n+CMT: \"+1\",\"\",\"ts\"\r\nhal", &mut stray);
        assert_eq!(
            scanner.finish(&mut stray),
            [Urc::Incomplete("+CMT: \"+1\",\"\",\"ts\"".into())]
        );
        assert_eq!(stray, ["hal"]);
    }

    #[test]
    fn it_bounds_an_unterminated_line() {
        let mut scanner = UrcScanner::new();
        let mut stray = Vec::new();
        let noise = vec![b'x'; MAX_PARTIAL + 1];
        assert!(scanner.feed(&noise, &mut stray).is_empty());
        assert_eq!(stray.len(), 1);
        assert!(scanner.partial.is_empty());

        let found = scanner.feed(b"+CREG: 2\r\n", &mut stray);
        assert_eq!(found, [Urc::Registration("+CREG: 2".into())]);
    }
}
