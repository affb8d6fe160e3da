//! Weighted fair queuing of upload bandwidth across the peers requesting chunks from us.
//!
//! Every peer owns a flow. Each entry gets a virtual finish time when it is enqueued, and the
//!  entry with the globally smallest finish time goes first. A flow's weight is its share of
//!  all queued bytes, so a peer that queues a lot of requests has its entries pushed further
//!  back than a peer asking for little.

use anyhow::anyhow;
use ordered_float::OrderedFloat;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use tracing::trace;


#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FlowId(pub(crate) u32);

struct Entry<V> {
    value: V,
    size: u64,
    finish: OrderedFloat<f64>,
}

struct Flow<V> {
    last_virtual_finish: f64,
    queued_bytes: u64,
    /// ordered by finish time, since finish times within a flow only grow
    queue: VecDeque<Entry<V>>,
}


pub struct WeightedFairQueue<V> {
    /// bytes per second
    rate: f64,
    flows: FxHashMap<FlowId, Flow<V>>,
    next_flow_id: u32,
    total_queued_bytes: u64,
}
impl <V: PartialEq> WeightedFairQueue<V> {
    pub fn new(rate: f64) -> WeightedFairQueue<V> {
        assert!(rate > 0.0);
        WeightedFairQueue {
            rate,
            flows: FxHashMap::default(),
            next_flow_id: 0,
            total_queued_bytes: 0,
        }
    }

    pub fn add_flow(&mut self) -> FlowId {
        let id = FlowId(self.next_flow_id);
        self.next_flow_id += 1;
        self.flows.insert(id, Flow {
            last_virtual_finish: 0.0,
            queued_bytes: 0,
            queue: VecDeque::new(),
        });
        id
    }

    /// removes a flow with all its entries, returning the number of dropped entries
    pub fn remove_flow(&mut self, flow: FlowId) -> usize {
        match self.flows.remove(&flow) {
            Some(removed) => {
                self.total_queued_bytes -= removed.queued_bytes;
                removed.queue.len()
            }
            None => 0,
        }
    }

    pub fn total_queued_bytes(&self) -> u64 {
        self.total_queued_bytes
    }

    pub fn len(&self, flow: FlowId) -> usize {
        self.flows.get(&flow)
            .map(|f| f.queue.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.total_queued_bytes == 0 && self.flows.values().all(|f| f.queue.is_empty())
    }

    /// `now` is in seconds on a clock shared by all calls
    pub fn enqueue(&mut self, flow: FlowId, size: u64, value: V, now: f64) -> anyhow::Result<()> {
        let total = self.total_queued_bytes + size;
        let f = self.flows.get_mut(&flow)
            .ok_or_else(|| anyhow!("unknown flow {:?}", flow))?;

        let weight = if total == 0 { 1.0 } else { (f.queued_bytes + size) as f64 / total as f64 };
        let finish = now.max(f.last_virtual_finish) + size as f64 * weight / self.rate;
        trace!(?flow, size, weight, finish, "enqueue");

        f.last_virtual_finish = finish;
        f.queued_bytes += size;
        f.queue.push_back(Entry {
            value,
            size,
            finish: OrderedFloat(finish),
        });
        self.total_queued_bytes += size;
        Ok(())
    }

    fn pop_head(&mut self, flow: FlowId) -> Option<V> {
        let f = self.flows.get_mut(&flow)?;
        let entry = f.queue.pop_front()?;
        f.queued_bytes -= entry.size;
        self.total_queued_bytes -= entry.size;
        Some(entry.value)
    }

    fn first_flow(&self, eligible: impl Fn(FlowId) -> bool) -> Option<FlowId> {
        self.flows.iter()
            .filter(|(id, _)| eligible(**id))
            .filter_map(|(id, f)| f.queue.front().map(|e| (e.finish, *id)))
            .min()
            .map(|(_, id)| id)
    }

    /// the entry with the globally smallest virtual finish time
    pub fn dequeue(&mut self) -> Option<(FlowId, V)> {
        let flow = self.first_flow(|_| true)?;
        self.pop_head(flow).map(|v| (flow, v))
    }

    /// Dequeues the head of `flow` if it has the smallest finish time among the flows that
    ///  are currently `eligible` to send (`flow` itself is always considered)
    pub fn dequeue_if_first(&mut self, flow: FlowId, eligible: impl Fn(FlowId) -> bool) -> Option<V> {
        if self.first_flow(|id| id == flow || eligible(id))? != flow {
            return None;
        }
        self.pop_head(flow)
    }

    /// removes the first queued entry of `flow` equal to `value`
    pub fn remove(&mut self, flow: FlowId, value: &V) -> bool {
        let Some(f) = self.flows.get_mut(&flow) else {
            return false;
        };
        let Some(pos) = f.queue.iter().position(|e| &e.value == value) else {
            return false;
        };
        if let Some(entry) = f.queue.remove(pos) {
            f.queued_bytes -= entry.size;
            self.total_queued_bytes -= entry.size;
        }
        true
    }
}
