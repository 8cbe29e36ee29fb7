/// Page-size bookkeeping shared by every paginated REST listing.
///
/// A `limit` of zero means "fetch everything". Each page requests
/// `min(hard_limit, remaining)` items, and paging stops as soon as a page
/// comes back with fewer than `hard_limit` items or the limit is reached.
#[derive(Debug, Clone, Copy)]
pub struct PagePlan {
    hard_limit: u32,
    remaining: Option<u32>,
    finished: bool,
}

impl PagePlan {
    pub fn new(limit: u32, hard_limit: u32) -> Self {
        let hard_limit = hard_limit.max(1);
        Self {
            hard_limit,
            remaining: (limit != 0).then_some(limit),
            finished: false,
        }
    }

    pub fn hard_limit(&self) -> u32 {
        self.hard_limit
    }

    /// Size of the next page to request, or `None` when paging is done.
    pub fn next_page(&self) -> Option<u32> {
        if self.finished {
            return None;
        }
        match self.remaining {
            Some(0) => None,
            Some(remaining) => Some(remaining.min(self.hard_limit)),
            None => Some(self.hard_limit),
        }
    }

    /// Record the size of a page that was just received.
    pub fn record(&mut self, received: usize) {
        let received = u32::try_from(received).unwrap_or(u32::MAX);
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(received);
        }
        if received < self.hard_limit {
            self.finished = true;
        }
    }
}
