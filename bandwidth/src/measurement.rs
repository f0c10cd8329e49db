use serde::{
    Deserialize,
    Serialize,
};

/// A single throughput sample as kept in the measurement log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
    /// Bits per second.
    pub throughput: u64,
    pub note: String,
}

impl Measurement {
    pub fn new(timestamp: i64, throughput: u64, note: &str) -> Self {
        Self {
            timestamp,
            throughput,
            note: sanitize_note(note),
        }
    }

    /// One record per line: `<timestamp> <throughput> <note>\n`.
    pub(crate) fn to_line(&self) -> String {
        format!("{} {} {}\n", self.timestamp, self.throughput, self.note)
    }

    /// Parses a line without its terminator. The note may be empty or contain spaces.
    pub(crate) fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.splitn(3, ' ');
        let timestamp = fields.next()?.parse().ok()?;
        let throughput = fields.next()?.parse().ok()?;
        let note = fields.next().unwrap_or_default().to_string();
        Some(Self {
            timestamp,
            throughput,
            note,
        })
    }
}

/// Notes are stored inline, so line separators become spaces.
pub fn sanitize_note(note: &str) -> String {
    note.replace("\r\n", " ").replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn notes_never_carry_line_separators() {
        assert_eq!(sanitize_note("a\nb"), "a b");
        assert_eq!(sanitize_note("a\r\nb\rc"), "a b c");
        assert_eq!(Measurement::new(1, 2, "x\ny").note, "x y");
    }

    #[test]
    fn parses_lines() {
        assert_eq!(
            Measurement::parse_line("1700000000000 5000 download speed"),
            Some(Measurement::new(1_700_000_000_000, 5000, "download speed"))
        );
        assert_eq!(Measurement::parse_line("10 20 "), Some(Measurement::new(10, 20, "")));
        assert_eq!(Measurement::parse_line("10 20"), Some(Measurement::new(10, 20, "")));
        assert_eq!(Measurement::parse_line("10"), None);
        assert_eq!(Measurement::parse_line("ten 20 x"), None);
        assert_eq!(Measurement::parse_line("10 -20 x"), None);
        assert_eq!(Measurement::parse_line(""), None);
    }

    #[test]
    fn line_layout() {
        assert_eq!(Measurement::new(10, 20, "note").to_line(), "10 20 note\n");
        assert_eq!(Measurement::new(10, 20, "").to_line(), "10 20 \n");
    }
}
