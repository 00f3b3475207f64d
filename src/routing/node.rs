use super::NodeHandle;
use crate::id::NodeId;
use std::{
    collections::VecDeque,
    fmt::{self, Debug, Formatter},
    net::SocketAddr,
    time::{Duration, Instant},
};

/// Maximum wait period before a node becomes questionable.
pub(crate) const MAX_LAST_SEEN: Duration = Duration::from_secs(15 * 60);

/// Timeouts in a row after which a node is bad no matter what.
const MAX_TIMEOUTS_IN_A_ROW: usize = 3;

/// Timeouts in a row after which a node we have not heard from recently is bad.
const MAX_STALE_TIMEOUTS_IN_A_ROW: usize = 2;

/// Number of events remembered per node.
const EVENT_LOG_LEN: usize = 10;

/// Weight of a new sample in the rolling RTT average.
const RTT_SAMPLE_WEIGHT: f64 = 0.2;

/// Status of the node.
/// Ordering of the enumerations is important, variants higher
/// up are considered to be less than those further down.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Ord, PartialOrd)]
pub(crate) enum NodeStatus {
    Bad,
    Questionable,
    Good,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum NodeEvent {
    Query,
    Response,
    Timeout,
}

/// Node participating in the dht, with the liveness stats the routing table keeps for it.
#[derive(Clone)]
pub(crate) struct RoutingNode {
    handle: NodeHandle,
    rtt: Option<Duration>,
    num_queries: usize,
    num_responses: usize,
    num_timeouts: usize,
    events: VecDeque<(NodeEvent, Instant)>,
    in_quarantine: bool,
    creation_ts: Instant,
    last_action_ts: Instant,
}

impl RoutingNode {
    /// Create a node we have just heard about. Every new node starts in quarantine.
    pub fn new(handle: NodeHandle, now: Instant) -> Self {
        Self {
            handle,
            rtt: None,
            num_queries: 0,
            num_responses: 0,
            num_timeouts: 0,
            events: VecDeque::with_capacity(EVENT_LOG_LEN),
            in_quarantine: true,
            creation_ts: now,
            last_action_ts: now,
        }
    }

    /// Record that the node sent us a query.
    pub fn on_query(&mut self, now: Instant, quarantine: Duration) {
        self.num_queries += 1;
        self.last_action_ts = now;
        self.push_event(NodeEvent::Query, now);

        if self.num_responses > 0 && self.quarantine_over(now, quarantine) {
            self.in_quarantine = false;
        }
    }

    /// Record that the node responded to one of our queries.
    pub fn on_response(&mut self, rtt: Option<Duration>, now: Instant, quarantine: Duration) {
        self.num_responses += 1;
        self.last_action_ts = now;
        self.push_event(NodeEvent::Response, now);

        if let Some(sample) = rtt {
            self.rtt = Some(match self.rtt {
                Some(avg) => avg.mul_f64(1.0 - RTT_SAMPLE_WEIGHT) + sample.mul_f64(RTT_SAMPLE_WEIGHT),
                None => sample,
            });
        }

        if self.quarantine_over(now, quarantine) {
            self.in_quarantine = false;
        }
    }

    /// Record that one of our queries to the node timed out.
    pub fn on_timeout(&mut self, now: Instant) {
        self.num_timeouts += 1;
        self.push_event(NodeEvent::Timeout, now);
    }

    /// Number of most recent consecutive timeouts. A response always ends the run; a query from
    /// the node ends it only when `include_queries` is set.
    pub fn timeouts_in_a_row(&self, include_queries: bool) -> usize {
        let mut count = 0;

        for (event, _) in self.events.iter().rev() {
            match event {
                NodeEvent::Timeout => count += 1,
                NodeEvent::Response => break,
                NodeEvent::Query if include_queries => break,
                NodeEvent::Query => (),
            }
        }

        count
    }

    /// Current status of the node.
    pub fn status(&self, now: Instant) -> NodeStatus {
        let timeouts = self.timeouts_in_a_row(false);
        let recent = now.saturating_duration_since(self.last_action_ts) < MAX_LAST_SEEN;

        if timeouts >= MAX_TIMEOUTS_IN_A_ROW {
            NodeStatus::Bad
        } else if self.num_responses > 0 && recent {
            NodeStatus::Good
        } else if !recent && timeouts >= MAX_STALE_TIMEOUTS_IN_A_ROW {
            NodeStatus::Bad
        } else {
            NodeStatus::Questionable
        }
    }

    /// Is node good or questionable?
    pub fn is_pingable(&self, now: Instant) -> bool {
        self.status(now) != NodeStatus::Bad
    }

    pub fn quarantine_over(&self, now: Instant, quarantine: Duration) -> bool {
        now.saturating_duration_since(self.creation_ts) >= quarantine
    }

    pub fn in_quarantine(&self) -> bool {
        self.in_quarantine
    }

    /// Admission into a bucket's main list ends the quarantine.
    pub fn lift_quarantine(&mut self) {
        self.in_quarantine = false;
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    pub fn id(&self) -> NodeId {
        self.handle.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    #[cfg(test)]
    pub fn num_queries(&self) -> usize {
        self.num_queries
    }

    pub fn num_responses(&self) -> usize {
        self.num_responses
    }

    pub fn last_action_ts(&self) -> Instant {
        self.last_action_ts
    }

    #[cfg(test)]
    pub fn events(&self) -> impl Iterator<Item = &(NodeEvent, Instant)> {
        self.events.iter()
    }

    fn push_event(&mut self, event: NodeEvent, now: Instant) {
        if self.events.len() == EVENT_LOG_LEN {
            self.events.pop_front();
        }
        self.events.push_back((event, now));
    }
}

impl Debug for RoutingNode {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("RoutingNode")
            .field("id", &self.handle.id)
            .field("addr", &self.handle.addr)
            .field("rtt", &self.rtt)
            .field("responses", &self.num_responses)
            .field("timeouts", &self.num_timeouts)
            .field("in_quarantine", &self.in_quarantine)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    const QUARANTINE: Duration = Duration::from_secs(180);

    fn dummy_node(now: Instant) -> RoutingNode {
        RoutingNode::new(
            NodeHandle::new(test::dummy_node_id(), test::dummy_socket_addr_v4()),
            now,
        )
    }

    #[test]
    fn positive_new_node_questionable() {
        let now = Instant::now();
        let node = dummy_node(now);

        assert_eq!(node.status(now), NodeStatus::Questionable);
        assert!(node.in_quarantine());
    }

    #[test]
    fn positive_response_makes_good() {
        let now = Instant::now();
        let mut node = dummy_node(now);

        node.on_response(Some(Duration::from_millis(100)), now, QUARANTINE);

        assert_eq!(node.status(now), NodeStatus::Good);
        assert_eq!(node.rtt(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn positive_rolling_rtt() {
        let now = Instant::now();
        let mut node = dummy_node(now);

        node.on_response(Some(Duration::from_millis(100)), now, QUARANTINE);
        node.on_response(Some(Duration::from_millis(200)), now, QUARANTINE);

        // 0.8 * 100 + 0.2 * 200
        let rtt = node.rtt().unwrap().as_secs_f64();
        assert!((rtt - 0.120).abs() < 1e-6);
    }

    #[test]
    fn positive_node_idle() {
        let now = Instant::now();
        let mut node = dummy_node(now);

        node.on_response(None, now, QUARANTINE);

        assert_eq!(node.status(now + MAX_LAST_SEEN), NodeStatus::Questionable);
    }

    #[test]
    fn positive_three_timeouts_make_bad() {
        let now = Instant::now();
        let mut node = dummy_node(now);
        node.on_response(None, now, QUARANTINE);

        node.on_timeout(now);
        node.on_timeout(now);
        assert_eq!(node.status(now), NodeStatus::Good);

        node.on_timeout(now);
        assert_eq!(node.status(now), NodeStatus::Bad);
    }

    #[test]
    fn positive_stale_node_bad_after_two_timeouts() {
        let now = Instant::now();
        let mut node = dummy_node(now);
        node.on_response(None, now, QUARANTINE);

        let later = now + MAX_LAST_SEEN;
        node.on_timeout(later);
        assert_eq!(node.status(later), NodeStatus::Questionable);

        node.on_timeout(later);
        assert_eq!(node.status(later), NodeStatus::Bad);
    }

    #[test]
    fn positive_timeouts_in_a_row() {
        let now = Instant::now();
        let mut node = dummy_node(now);

        node.on_timeout(now);
        node.on_response(None, now, QUARANTINE);
        node.on_timeout(now);
        node.on_query(now, QUARANTINE);
        node.on_timeout(now);

        assert_eq!(node.timeouts_in_a_row(false), 2);
        assert_eq!(node.timeouts_in_a_row(true), 1);
    }

    #[test]
    fn positive_event_log_bounded() {
        let now = Instant::now();
        let mut node = dummy_node(now);

        for _ in 0..(EVENT_LOG_LEN + 5) {
            node.on_query(now, QUARANTINE);
        }

        assert_eq!(node.events().count(), EVENT_LOG_LEN);
        assert_eq!(node.num_queries(), EVENT_LOG_LEN + 5);
    }

    #[test]
    fn positive_quarantine_lifted_by_late_response() {
        let now = Instant::now();
        let mut node = dummy_node(now);

        node.on_response(None, now + Duration::from_secs(10), QUARANTINE);
        assert!(node.in_quarantine());

        node.on_response(None, now + QUARANTINE, QUARANTINE);
        assert!(!node.in_quarantine());
    }

    #[test]
    fn negative_query_without_response_keeps_quarantine() {
        let now = Instant::now();
        let mut node = dummy_node(now);

        node.on_query(now + QUARANTINE, QUARANTINE);

        assert!(node.in_quarantine());
    }

    #[test]
    fn positive_status_ordering() {
        assert!(NodeStatus::Good > NodeStatus::Questionable);
        assert!(NodeStatus::Questionable > NodeStatus::Bad);
    }
}
