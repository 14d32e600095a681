use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Import,
    TagNormalization,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::TagNormalization => "tag normalization",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allows at most one running job per kind. Clones share the same flags.
#[derive(Debug, Clone, Default)]
pub struct JobGuard {
    import: Arc<AtomicBool>,
    tag_normalization: Arc<AtomicBool>,
}

impl JobGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self, kind: JobKind) -> &Arc<AtomicBool> {
        match kind {
            JobKind::Import => &self.import,
            JobKind::TagNormalization => &self.tag_normalization,
        }
    }

    /// Claim the slot for `kind`. Returns `None` while another ticket for it is alive.
    pub fn try_start(&self, kind: JobKind) -> Option<JobTicket> {
        let flag = self.flag(kind);
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(JobTicket {
            kind,
            flag: Arc::clone(flag),
        })
    }

    pub fn is_running(&self, kind: JobKind) -> bool {
        self.flag(kind).load(Ordering::Acquire)
    }
}

/// Proof that a job holds its slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct JobTicket {
    kind: JobKind,
    flag: Arc<AtomicBool>,
}

impl JobTicket {
    pub fn kind(&self) -> JobKind {
        self.kind
    }
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_start_is_refused_until_ticket_drops() {
        let guard = JobGuard::new();
        let ticket = guard.try_start(JobKind::Import).unwrap();
        assert!(guard.try_start(JobKind::Import).is_none());
        assert!(guard.clone().try_start(JobKind::Import).is_none());
        drop(ticket);
        assert!(guard.try_start(JobKind::Import).is_some());
    }

    #[test]
    fn kinds_are_independent() {
        let guard = JobGuard::new();
        let _import = guard.try_start(JobKind::Import).unwrap();
        assert!(guard.try_start(JobKind::TagNormalization).is_some());
    }

    #[test]
    fn ticket_released_when_job_errors_out() {
        fn failing_job(guard: &JobGuard) -> Result<(), String> {
            let _ticket = guard.try_start(JobKind::TagNormalization).ok_or("busy")?;
            Err("boom".into())
        }
        let guard = JobGuard::new();
        assert!(failing_job(&guard).is_err());
        assert!(!guard.is_running(JobKind::TagNormalization));
    }
}
