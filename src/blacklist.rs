use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Queries that hang or are unsupported on MSO5000 firmware.
pub const KNOWN_BAD_QUERIES: &[&str] = &[
    ":SYSTem:UPTime?",
    ":SYSTem:TEMPerature?",
    ":SYSTem:OPTions?",
    ":TIMebase:HREFerence?",
    ":ACQuire:MODE?",
    ":WAVeform:YINCrement?",
    ":WAVeform:YORigin?",
    ":WAVeform:YREFerence?",
    ":MATH1:PROB?",
    ":MATH2:PROB?",
    ":MATH3:PROB?",
    ":MATH4:PROB?",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FailureEntry {
    failures: u32,
    cooldown_until: Option<Instant>,
}

/// Outcome of asking whether a template may go on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Cool-down expired; one probe attempt is allowed.
    Probe,
    CoolingDown { remaining: Duration },
    Permanent,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed | Self::Probe)
    }
}

/// Consecutive-failure counter per command template with a cool-down window.
#[derive(Debug, Clone)]
pub struct QueryBlacklist {
    threshold: u32,
    cooldown: Duration,
    entries: HashMap<String, FailureEntry>,
    permanent: HashSet<String>,
}

impl QueryBlacklist {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            entries: HashMap::new(),
            permanent: HashSet::new(),
        }
    }

    /// Blacklist pre-seeded with [`KNOWN_BAD_QUERIES`].
    pub fn with_known_bad(threshold: u32, cooldown: Duration) -> Self {
        let mut blacklist = Self::new(threshold, cooldown);
        for template in KNOWN_BAD_QUERIES {
            blacklist.block_permanently(template);
        }
        blacklist
    }

    pub fn block_permanently(&mut self, template: &str) {
        self.permanent.insert(normalize(template));
    }

    pub fn admission(&self, template: &str, now: Instant) -> Admission {
        let key = normalize(template);
        if self.permanent.contains(&key) {
            return Admission::Permanent;
        }
        match self.entries.get(&key).and_then(|e| e.cooldown_until) {
            Some(until) if now < until => Admission::CoolingDown {
                remaining: until - now,
            },
            Some(_) => Admission::Probe,
            None => Admission::Allowed,
        }
    }

    /// Record a failed attempt. Returns true when this failure (re)arms the cool-down.
    pub fn record_failure(&mut self, template: &str, now: Instant) -> bool {
        let threshold = self.threshold;
        let cooldown = self.cooldown;
        let entry = self.entries.entry(normalize(template)).or_insert(FailureEntry {
            failures: 0,
            cooldown_until: None,
        });
        entry.failures = entry.failures.saturating_add(1);
        if entry.failures >= threshold {
            entry.cooldown_until = Some(now + cooldown);
            true
        } else {
            false
        }
    }

    pub fn record_success(&mut self, template: &str) {
        self.entries.remove(&normalize(template));
    }

    pub fn failures(&self, template: &str) -> u32 {
        self.entries.get(&normalize(template)).map_or(0, |e| e.failures)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Templates currently cooling down.
    pub fn blocked(&self, now: Instant) -> Vec<String> {
        let mut blocked: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.cooldown_until.is_some_and(|until| now < until))
            .map(|(k, _)| k.clone())
            .collect();
        blocked.sort();
        blocked
    }
}

// SCPI mnemonics are case-insensitive.
fn normalize(template: &str) -> String {
    template.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blacklisted_after_threshold() {
        let mut blacklist = QueryBlacklist::new(3, Duration::from_secs(30));
        let now = Instant::now();
        assert!(!blacklist.record_failure(":ACQ:SRAT?", now));
        assert!(!blacklist.record_failure(":ACQ:SRAT?", now));
        assert_eq!(blacklist.admission(":ACQ:SRAT?", now), Admission::Allowed);
        assert!(blacklist.record_failure(":ACQ:SRAT?", now));
        assert!(matches!(
            blacklist.admission(":acq:srat?", now),
            Admission::CoolingDown { .. }
        ));
        assert_eq!(blacklist.blocked(now), vec![":ACQ:SRAT?".to_string()]);
    }

    #[test]
    fn test_success_resets_count() {
        let mut blacklist = QueryBlacklist::new(3, Duration::from_secs(30));
        let now = Instant::now();
        blacklist.record_failure(":TRIG:STAT?", now);
        blacklist.record_failure(":TRIG:STAT?", now);
        blacklist.record_success(":TRIG:STAT?");
        assert_eq!(blacklist.failures(":TRIG:STAT?"), 0);
        assert!(!blacklist.record_failure(":TRIG:STAT?", now));
    }

    #[test]
    fn test_probe_after_cooldown_and_rearm() {
        let mut blacklist = QueryBlacklist::new(2, Duration::from_millis(100));
        let start = Instant::now();
        blacklist.record_failure("*IDN?", start);
        blacklist.record_failure("*IDN?", start);
        let later = start + Duration::from_millis(150);
        assert_eq!(blacklist.admission("*IDN?", later), Admission::Probe);

        // A failed probe immediately re-arms the cool-down.
        assert!(blacklist.record_failure("*IDN?", later));
        assert!(matches!(
            blacklist.admission("*IDN?", later),
            Admission::CoolingDown { .. }
        ));
    }

    #[test]
    fn test_known_bad_is_permanent() {
        let blacklist = QueryBlacklist::with_known_bad(3, Duration::from_secs(1));
        let far_future = Instant::now() + Duration::from_secs(3600);
        assert_eq!(blacklist.admission(":MATH2:PROB?", far_future), Admission::Permanent);
        assert!(blacklist.admission(":CHAN2:PROB?", far_future).is_allowed());
    }
}
