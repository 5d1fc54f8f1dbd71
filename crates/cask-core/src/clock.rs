use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::Result;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

static LAST_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Current UTC time, strictly increasing within this process at
/// microsecond resolution.
pub(crate) fn now() -> OffsetDateTime {
    let wall = i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000)
        .unwrap_or(i64::MAX);
    let mut last = LAST_MICROS.load(Ordering::Relaxed);
    let micros = loop {
        let next = wall.max(last.saturating_add(1));
        match LAST_MICROS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => break next,
            Err(actual) => last = actual,
        }
    };
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
}

pub(crate) fn format(at: OffsetDateTime) -> Result<String> {
    Ok(at.format(&Rfc3339)?)
}

pub(crate) fn timestamp() -> Result<String> {
    format(now())
}

pub(crate) fn parse(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).ok()
}

pub(crate) fn after(at: OffsetDateTime, duration: Duration) -> OffsetDateTime {
    let span = time::Duration::try_from(duration).unwrap_or(time::Duration::MAX);
    at.checked_add(span).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_strictly_increase() {
        let mut previous = now();
        for _ in 0..1_000 {
            let next = now();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn formatted_timestamps_parse_back() -> Result<()> {
        let at = now();
        let text = format(at)?;
        assert_eq!(parse(&text), Some(at));
        assert!(parse("yesterday").is_none());
        Ok(())
    }
}
