//! One-shot countdown checked against a free-running millisecond tick.

pub type Ticks = u64;

#[derive(Debug, Default)]
pub struct Timer {
    deadline: Option<Ticks>,
}

impl Timer {
    #[inline]
    pub fn new() -> Timer {
        Timer { deadline: None }
    }

    /// Arms (or re-arms) the timer `duration` ticks from `now`.
    #[inline]
    pub fn start(&mut self, now: Ticks, duration: Ticks) {
        self.deadline = Some(now + duration);
    }

    #[inline]
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    #[inline]
    pub fn running(&self) -> bool {
        self.deadline.is_some()
    }

    /// Returns true exactly once when the deadline has been reached.
    #[inline]
    pub fn expire(&mut self, now: Ticks) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
