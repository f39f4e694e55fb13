//! Human-readable rendering of query results.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::proto::{Decimal, ResultSet, Uuid, Value, value};

/// Day number of 1970-01-01 in the CQL `date` encoding.
const CQL_DATE_EPOCH: i64 = 1 << 31;

pub fn format_value(value: &Value) -> String {
    let Some(inner) = &value.inner else {
        return "<empty>".to_string();
    };
    match inner {
        value::Inner::Null(_) => "null".to_string(),
        value::Inner::Unset(_) => "unset".to_string(),
        value::Inner::Int(v) => v.to_string(),
        value::Inner::Float(v) => v.to_string(),
        value::Inner::Double(v) => v.to_string(),
        value::Inner::Boolean(v) => v.to_string(),
        value::Inner::String(v) => v.clone(),
        value::Inner::Bytes(v) => format!("0x{}", hex::encode(v)),
        value::Inner::Inet(inet) => format_inet(&inet.value),
        value::Inner::Uuid(uuid) => format_uuid(uuid),
        value::Inner::Date(days) => format_date(*days),
        value::Inner::Time(nanos) => format_time(*nanos),
        value::Inner::Collection(collection) => {
            let elements = collection.elements.iter().map(format_value).collect::<Vec<_>>();
            format!("[{}]", elements.join(", "))
        }
        value::Inner::Udt(udt) => {
            let mut fields = udt.fields.iter().collect::<Vec<_>>();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            let fields = fields
                .into_iter()
                .map(|(name, value)| format!("{name}: {}", format_value(value)))
                .collect::<Vec<_>>();
            format!("{{{}}}", fields.join(", "))
        }
        value::Inner::Varint(varint) => format_varint(&varint.value),
        value::Inner::Decimal(decimal) => format_decimal(decimal),
    }
}

fn format_inet(bytes: &[u8]) -> String {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        Ipv4Addr::from(octets).to_string()
    } else if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
        Ipv6Addr::from(octets).to_string()
    } else {
        format!("0x{}", hex::encode(bytes))
    }
}

fn format_uuid(uuid: &Uuid) -> String {
    let bytes: [u8; 16] = match <[u8; 16]>::try_from(uuid.value.as_slice()) {
        Ok(bytes) => bytes,
        Err(_) => {
            let mut bytes = [0u8; 16];
            bytes[..8].copy_from_slice(&uuid.msb.to_be_bytes());
            bytes[8..].copy_from_slice(&uuid.lsb.to_be_bytes());
            bytes
        }
    };
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn format_date(days: u32) -> String {
    let (year, month, day) = civil_from_days(i64::from(days) - CQL_DATE_EPOCH);
    format!("{year:04}-{month:02}-{day:02}")
}

// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

fn format_time(nanos: u64) -> String {
    let secs = nanos / 1_000_000_000;
    let frac = nanos % 1_000_000_000;
    format!(
        "{:02}:{:02}:{:02}.{frac:09}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    )
}

/// Big-endian two's complement integer, as CQL encodes `varint`.
fn varint_to_i128(bytes: &[u8]) -> Option<i128> {
    if bytes.is_empty() || bytes.len() > 16 {
        return None;
    }
    let fill = if bytes[0] & 0x80 != 0 { 0xff } else { 0x00 };
    let mut buf = [fill; 16];
    buf[16 - bytes.len()..].copy_from_slice(bytes);
    Some(i128::from_be_bytes(buf))
}

fn format_varint(bytes: &[u8]) -> String {
    varint_to_i128(bytes).map_or_else(|| format!("varint(0x{})", hex::encode(bytes)), |v| v.to_string())
}

fn format_decimal(decimal: &Decimal) -> String {
    let Some(unscaled) = varint_to_i128(&decimal.value) else {
        return format!("decimal(0x{}, scale {})", hex::encode(&decimal.value), decimal.scale);
    };
    let scale = decimal.scale as usize;
    if scale == 0 {
        return unscaled.to_string();
    }
    let digits = format!("{:0>width$}", unscaled.unsigned_abs(), width = scale + 1);
    let (int_part, frac_part) = digits.split_at(digits.len() - scale);
    let sign = if unscaled < 0 { "-" } else { "" };
    format!("{sign}{int_part}.{frac_part}")
}

/// A result set laid out as one header line and one line per row.
pub struct ResultTable<'a>(pub &'a ResultSet);

impl ResultTable<'_> {
    /// Each row as `column=value` pairs.
    pub fn rows(&self) -> Vec<String> {
        self.0
            .rows
            .iter()
            .map(|row| {
                row.values
                    .iter()
                    .enumerate()
                    .map(|(i, value)| {
                        let name = self.0.columns.get(i).map_or("?", |c| c.name.as_str());
                        format!("{name}={}", format_value(value))
                    })
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .collect()
    }
}

impl fmt::Display for ResultTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.0.columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
        writeln!(f, "{}", header.join(" | "))?;
        for row in &self.0.rows {
            let cells = row.values.iter().map(format_value).collect::<Vec<_>>();
            writeln!(f, "{}", cells.join(" | "))?;
        }
        write!(f, "({} rows)", self.0.rows.len())
    }
}
