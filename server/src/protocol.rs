//! The line protocol spoken by the request listener.
//!
//! Requests look like HTTP but only the request line is interpreted:
//!
//! ```text
//! GET /retrieve_last?u=13&t=5 HTTP/1.1
//! GET /retrieve_range?s=1700000000000&e=1700000600000 HTTP/1.1
//! ```

use chrono::{
    DateTime,
    Days,
    LocalResult,
    Months,
    NaiveDateTime,
    Offset as _,
    TimeDelta,
    TimeZone,
};
use flood_bandwidth::Measurement;
use std::{
    fmt::Write as _,
    io,
    str::FromStr,
};
use strum::{
    Display,
    EnumString,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum RequestType {
    RetrieveLast,
    RetrieveRange,
}

/// Calendar units addressed by the numeric codes `retrieve_last` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TimeUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    /// Codes follow the classic calendar field numbering, aliases included.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => Self::Year,
            2 => Self::Month,
            3 | 4 | 8 => Self::Week,
            5..=7 => Self::Day,
            10 | 11 => Self::Hour,
            12 => Self::Minute,
            13 => Self::Second,
            14 => Self::Millisecond,
            _ => return None,
        })
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Year => 1,
            Self::Month => 2,
            Self::Week => 3,
            Self::Day => 5,
            Self::Hour => 10,
            Self::Minute => 12,
            Self::Second => 13,
            Self::Millisecond => 14,
        }
    }

    /// Moves `at` back by `amount` units. Days, months and years follow the wall clock
    /// of `at`'s time zone. `None` only when the result leaves the supported calendar.
    pub fn subtract_from<Tz: TimeZone>(&self, at: DateTime<Tz>, amount: u32) -> Option<DateTime<Tz>> {
        let amount64 = i64::from(amount);
        match self {
            Self::Millisecond => at.checked_sub_signed(TimeDelta::try_milliseconds(amount64)?),
            Self::Second => at.checked_sub_signed(TimeDelta::try_seconds(amount64)?),
            Self::Minute => at.checked_sub_signed(TimeDelta::try_minutes(amount64)?),
            Self::Hour => at.checked_sub_signed(TimeDelta::try_hours(amount64)?),
            Self::Week => at.checked_sub_signed(TimeDelta::try_weeks(amount64)?),
            Self::Day => shift_wall_clock(&at, |local| local.checked_sub_days(Days::new(u64::from(amount)))),
            Self::Month => shift_wall_clock(&at, |local| local.checked_sub_months(Months::new(amount))),
            Self::Year => {
                let months = amount.checked_mul(12)?;
                shift_wall_clock(&at, |local| local.checked_sub_months(Months::new(months)))
            }
        }
    }
}

/// Applies `shift` to the local wall clock time of `at` and maps the result back.
///
/// A time repeated by a backward transition resolves to its earlier instant. A time
/// skipped by a forward transition is read with the offset in effect before the gap,
/// which lands the same distance past it.
fn shift_wall_clock<Tz: TimeZone>(
    at: &DateTime<Tz>,
    shift: impl FnOnce(NaiveDateTime) -> Option<NaiveDateTime>,
) -> Option<DateTime<Tz>> {
    let local = shift(at.naive_local())?;
    let tz = at.timezone();
    match tz.from_local_datetime(&local) {
        LocalResult::Single(shifted) => Some(shifted),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => {
            let before_gap = local.checked_sub_signed(TimeDelta::try_days(1)?)?;
            let offset = tz.from_local_datetime(&before_gap).earliest()?.offset().fix();
            let utc = local.checked_sub_signed(TimeDelta::try_seconds(i64::from(offset.local_minus_utc()))?)?;
            Some(tz.from_utc_datetime(&utc))
        }
    }
}

/// A validated request, ready to be answered from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSpec {
    /// Everything recorded within the last `amount` units.
    Last { unit: TimeUnit, amount: u32 },
    /// Inclusive range of millisecond timestamps, `from <= to`.
    Range { from: i64, to: i64 },
}

impl RequestSpec {
    pub fn request_type(&self) -> RequestType {
        match self {
            Self::Last { .. } => RequestType::RetrieveLast,
            Self::Range { .. } => RequestType::RetrieveRange,
        }
    }

    /// Inclusive millisecond bounds relative to `now`.
    pub fn resolve<Tz: TimeZone>(&self, now: DateTime<Tz>) -> Result<(i64, i64), ProtocolError> {
        match *self {
            Self::Last { unit, amount } => {
                let to = now.timestamp_millis();
                let from = unit.subtract_from(now, amount).ok_or(ProtocolError::OutOfRange)?;
                Ok((from.timestamp_millis(), to))
            }
            Self::Range { from, to } => Ok((from, to)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("no request line received")]
    Empty,
    #[error("malformed request line {0:?}")]
    MalformedRequestLine(String),
    #[error("malformed request target {0:?}")]
    MalformedTarget(String),
    #[error("unknown request type {0:?}")]
    UnknownRequestType(String),
    #[error("malformed query parameter {0:?}")]
    MalformedQuery(String),
    #[error("missing query parameter {0:?}")]
    MissingParameter(&'static str),
    #[error("query parameter {0:?} given more than once")]
    DuplicateParameter(&'static str),
    #[error("invalid value {value:?} for query parameter {name:?}")]
    InvalidParameter { name: &'static str, value: String },
    #[error("unknown time unit code {0}")]
    UnknownTimeUnit(i32),
    #[error("range start {from} is after its end {to}")]
    InvertedRange { from: i64, to: i64 },
    #[error("requested period reaches outside the supported calendar")]
    OutOfRange,
    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
    #[error("timed out waiting for the request line")]
    Timeout,
    #[error("failed to read the request: {0}")]
    Read(#[from] io::Error),
}

/// Parses a request line such as `GET /retrieve_last?u=12&t=30 HTTP/1.1`.
pub fn parse_request(line: &str) -> Result<RequestSpec, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }

    let tokens = line.split_ascii_whitespace().collect::<Vec<_>>();
    let [_method, target, _version] = tokens.as_slice() else {
        return Err(ProtocolError::MalformedRequestLine(line.to_string()));
    };

    let Some(target) = target.strip_prefix('/') else {
        return Err(ProtocolError::MalformedTarget(target.to_string()));
    };
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let request_type =
        RequestType::from_str(path).map_err(|_| ProtocolError::UnknownRequestType(path.to_string()))?;

    match request_type {
        RequestType::RetrieveLast => {
            let [unit, amount] = query_values(query, ["u", "t"])?;
            let code = parse_value::<i32>("u", unit)?;
            let unit = TimeUnit::from_code(code).ok_or(ProtocolError::UnknownTimeUnit(code))?;
            let amount = parse_value::<u32>("t", amount)?;
            if amount == 0 {
                return Err(ProtocolError::InvalidParameter {
                    name: "t",
                    value: amount.to_string(),
                });
            }
            Ok(RequestSpec::Last { unit, amount })
        }
        RequestType::RetrieveRange => {
            let [from, to] = query_values(query, ["s", "e"])?;
            let from = parse_value::<i64>("s", from)?;
            let to = parse_value::<i64>("e", to)?;
            if from > to {
                return Err(ProtocolError::InvertedRange { from, to });
            }
            Ok(RequestSpec::Range { from, to })
        }
    }
}

/// Picks the values of `names` out of `key=value&...`. Other keys are ignored.
fn query_values<'a, const N: usize>(query: &'a str, names: [&'static str; N]) -> Result<[&'a str; N], ProtocolError> {
    let mut values: [Option<&str>; N] = [None; N];
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(ProtocolError::MalformedQuery(pair.to_string()));
        };
        let Some(index) = names.iter().position(|name| *name == key) else {
            continue;
        };
        if values[index].replace(value).is_some() {
            return Err(ProtocolError::DuplicateParameter(names[index]));
        }
    }

    let mut found = [""; N];
    for (index, value) in values.into_iter().enumerate() {
        found[index] = value.ok_or(ProtocolError::MissingParameter(names[index]))?;
    }
    Ok(found)
}

fn parse_value<T: FromStr>(name: &'static str, value: &str) -> Result<T, ProtocolError> {
    value.parse().map_err(|_| ProtocolError::InvalidParameter {
        name,
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    InternalServerError,
    ServiceUnavailable,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::InternalServerError => 500,
            Self::ServiceUnavailable => 503,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::InternalServerError => "Internal Server Error",
            Self::ServiceUnavailable => "Service Unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub body: String,
}

impl Response {
    /// `200 OK` listing `records` as `[timestamp, throughput, note]` string triples.
    pub fn records(records: &[Measurement]) -> Self {
        let records = records
            .iter()
            .map(|m| [m.timestamp.to_string(), m.throughput.to_string(), m.note.clone()])
            .collect::<Vec<_>>();
        Self {
            status: Status::Ok,
            body: serde_json::json!({ "records": records }).to_string(),
        }
    }

    pub fn empty(status: Status) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status.code(), self.status.reason());
        if !self.body.is_empty() {
            head.push_str("Content-Type: application/json\r\n");
        }
        let _ = write!(head, "Content-Length: {}\r\nConnection: close\r\n\r\n", self.body.len());

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(self.body.as_bytes());
        bytes
    }
}
