use std::cell::RefCell;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

/// Append the current HTTP-date to `dst`, re-rendering at most once per second.
pub(crate) fn extend(dst: &mut Vec<u8>) {
    CACHED.with(|cache| {
        dst.extend_from_slice(cache.borrow_mut().check());
    })
}

struct CachedDate {
    bytes: [u8; DATE_VALUE_LENGTH],
    rendered_at: u64,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate::new()));

impl CachedDate {
    fn new() -> Self {
        let mut cache = CachedDate {
            bytes: [0; DATE_VALUE_LENGTH],
            rendered_at: u64::MAX,
        };
        cache.render(SystemTime::now());
        cache
    }

    fn check(&mut self) -> &[u8] {
        let now = SystemTime::now();
        let secs = unix_secs(now);
        if secs != self.rendered_at {
            self.render(now);
        }
        &self.bytes[..]
    }

    fn render(&mut self, now: SystemTime) {
        let s = httpdate::fmt_http_date(now);
        debug_assert_eq!(s.len(), DATE_VALUE_LENGTH);
        self.bytes.copy_from_slice(s.as_bytes());
        self.rendered_at = unix_secs(now);
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_len() {
        assert_eq!(DATE_VALUE_LENGTH, "Sun, 06 Nov 1994 08:49:37 GMT".len());
    }

    #[test]
    fn renders_plausible_date() {
        let mut buf = Vec::new();
        extend(&mut buf);
        assert_eq!(buf.len(), DATE_VALUE_LENGTH);
        assert!(buf.ends_with(b" GMT"));
    }
}
