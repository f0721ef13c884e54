//! Poll groups: one per worker thread, each owning a disjoint set of
//! HWQPs and a shared data-buffer budget for the requests they carry.

use crate::fabric::hwqp::HwqpId;

#[derive(Debug, Clone)]
pub struct PollGroup {
    pub hwqps: Vec<HwqpId>,
    /// queues assigned, including ones still in flight to the poller
    pub hwqp_count: u32,
    pub buf_total: u32,
    pub buf_avail: u32,
}

impl PollGroup {
    pub fn new(buf_total: u32) -> Self {
        Self {
            hwqps: Vec::new(),
            hwqp_count: 0,
            buf_total,
            buf_avail: buf_total,
        }
    }

    /// Take `count` buffers from the shared cache.
    pub fn get_buffers(&mut self, count: u32) -> bool {
        if self.buf_avail < count {
            return false;
        }
        self.buf_avail -= count;
        true
    }

    pub fn put_buffers(&mut self, count: u32) {
        self.buf_avail += count;
        assert!(self.buf_avail <= self.buf_total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_budget() {
        let mut pg = PollGroup::new(4);
        assert!(pg.get_buffers(3));
        assert!(!pg.get_buffers(2));
        assert!(pg.get_buffers(1));
        pg.put_buffers(4);
        assert_eq!(pg.buf_avail, 4);
    }
}
