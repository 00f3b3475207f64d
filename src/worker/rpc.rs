use super::{
    lookup::LookupId,
    timer::{Timeout, Timer},
    ScheduledTaskCheck,
};
use crate::{
    id::NodeId,
    message::{Message, MessageBody, Request},
    transaction::{TransactionID, TransactionIdGenerator},
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Who is waiting for the outcome of a query.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) enum Owner {
    Lookup(LookupId),
    /// Liveness check issued by the maintenance tasks or for a node that queried us.
    Ping,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum QueryKind {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl From<&Request> for QueryKind {
    fn from(request: &Request) -> Self {
        match request {
            Request::Ping(_) => Self::Ping,
            Request::FindNode(_) => Self::FindNode,
            Request::GetPeers(_) => Self::GetPeers,
            Request::AnnouncePeer(_) => Self::AnnouncePeer,
        }
    }
}

/// A query waiting for its response.
#[derive(Debug)]
pub(crate) struct Transaction {
    pub addr: SocketAddr,
    /// Id of the queried node, if we know it already.
    pub node_id: Option<NodeId>,
    pub kind: QueryKind,
    pub owner: Owner,
    pub sent_at: Instant,
    timeout: Timeout,
}

impl Transaction {
    pub fn rtt(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.sent_at)
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
pub(crate) enum RpcError {
    #[error("too many queries in flight")]
    Backpressure,
    #[error("transaction ids exhausted")]
    TidExhausted,
}

/// Table of the queries in flight, keyed by transaction id and the address they were sent to.
///
/// Every transaction ends exactly once: with a response, with an error, with a timeout or by
/// being cancelled. Its transaction id is then retired for a grace period.
pub(crate) struct RpcManager {
    tids: TransactionIdGenerator,
    in_flight: HashMap<(TransactionID, SocketAddr), Transaction>,
    max_pending: usize,
    timeout: Duration,
}

impl RpcManager {
    pub fn new(timeout: Duration, max_pending: usize, tid_grace: Duration) -> Self {
        Self {
            tids: TransactionIdGenerator::new(tid_grace),
            in_flight: HashMap::new(),
            max_pending,
            timeout,
        }
    }

    /// Register a new query and schedule its timeout. Returns the message to send.
    pub fn start(
        &mut self,
        addr: SocketAddr,
        node_id: Option<NodeId>,
        request: Request,
        owner: Owner,
        now: Instant,
        timer: &mut Timer<ScheduledTaskCheck>,
    ) -> Result<Message, RpcError> {
        if self.in_flight.len() >= self.max_pending {
            return Err(RpcError::Backpressure);
        }

        let tid = self.tids.generate(now).ok_or(RpcError::TidExhausted)?;
        let timeout = timer.schedule_at(
            now + self.timeout,
            ScheduledTaskCheck::RpcTimeout(tid, addr),
        );

        self.in_flight.insert(
            (tid, addr),
            Transaction {
                addr,
                node_id,
                kind: QueryKind::from(&request),
                owner,
                sent_at: now,
                timeout,
            },
        );

        Ok(Message {
            transaction_id: tid.as_bytes().to_vec(),
            body: MessageBody::Request(request),
        })
    }

    /// Match a response or an error received from `addr` to its transaction. Returns `None` for
    /// unsolicited, late or cancelled ones.
    pub fn finish(
        &mut self,
        transaction_id: &[u8],
        addr: SocketAddr,
        now: Instant,
        timer: &mut Timer<ScheduledTaskCheck>,
    ) -> Option<Transaction> {
        let tid = TransactionID::from_bytes(transaction_id)?;
        let transaction = self.in_flight.remove(&(tid, addr))?;

        timer.cancel(transaction.timeout);
        self.tids.release(tid, now);

        Some(transaction)
    }

    /// The timeout of a transaction fired.
    pub fn expire(
        &mut self,
        tid: TransactionID,
        addr: SocketAddr,
        now: Instant,
    ) -> Option<Transaction> {
        let transaction = self.in_flight.remove(&(tid, addr))?;
        self.tids.release(tid, now);

        Some(transaction)
    }

    /// Cancel every transaction of `owner`. Their outcomes will never be reported.
    pub fn cancel_owner(
        &mut self,
        owner: Owner,
        now: Instant,
        timer: &mut Timer<ScheduledTaskCheck>,
    ) -> usize {
        let keys: Vec<_> = self
            .in_flight
            .iter()
            .filter(|(_, transaction)| transaction.owner == owner)
            .map(|(key, _)| *key)
            .collect();

        for key in &keys {
            if let Some(transaction) = self.in_flight.remove(key) {
                timer.cancel(transaction.timeout);
                self.tids.release(key.0, now);
            }
        }

        keys.len()
    }

    /// Is a query of `owner` to `addr` still waiting for its outcome?
    pub fn has_pending(&self, addr: SocketAddr, owner: Owner) -> bool {
        self.in_flight
            .values()
            .any(|transaction| transaction.addr == addr && transaction.owner == owner)
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::PingRequest, test};

    const TIMEOUT: Duration = Duration::from_secs(2);
    const GRACE: Duration = Duration::from_secs(30);

    fn ping() -> Request {
        Request::Ping(PingRequest {
            id: test::dummy_node_id(),
        })
    }

    #[test]
    fn positive_response_matches_transaction() {
        let now = Instant::now();
        let addr = test::dummy_socket_addr_v4();
        let mut timer = Timer::new();
        let mut rpc = RpcManager::new(TIMEOUT, 8, GRACE);

        let message = rpc
            .start(addr, None, ping(), Owner::Ping, now, &mut timer)
            .unwrap();
        assert_eq!(rpc.num_in_flight(), 1);
        assert_eq!(timer.len(), 1);

        let later = now + Duration::from_millis(150);
        let transaction = rpc
            .finish(&message.transaction_id, addr, later, &mut timer)
            .unwrap();

        assert_eq!(transaction.kind, QueryKind::Ping);
        assert_eq!(transaction.owner, Owner::Ping);
        assert_eq!(transaction.rtt(later), Duration::from_millis(150));
        assert_eq!(rpc.num_in_flight(), 0);
        assert_eq!(timer.len(), 0);
    }

    #[test]
    fn negative_response_from_other_address() {
        let now = Instant::now();
        let addrs = test::dummy_block_socket_addrs(2);
        let mut timer = Timer::new();
        let mut rpc = RpcManager::new(TIMEOUT, 8, GRACE);

        let message = rpc
            .start(addrs[0], None, ping(), Owner::Ping, now, &mut timer)
            .unwrap();

        assert!(rpc
            .finish(&message.transaction_id, addrs[1], now, &mut timer)
            .is_none());
        assert_eq!(rpc.num_in_flight(), 1);
    }

    #[test]
    fn negative_response_after_timeout_dropped() {
        let now = Instant::now();
        let addr = test::dummy_socket_addr_v4();
        let mut timer = Timer::new();
        let mut rpc = RpcManager::new(TIMEOUT, 8, GRACE);

        let message = rpc
            .start(addr, None, ping(), Owner::Ping, now, &mut timer)
            .unwrap();
        let tid = TransactionID::from_bytes(&message.transaction_id).unwrap();

        assert!(rpc.expire(tid, addr, now + TIMEOUT).is_some());
        assert!(rpc.expire(tid, addr, now + TIMEOUT).is_none());
        assert!(rpc
            .finish(&message.transaction_id, addr, now + TIMEOUT, &mut timer)
            .is_none());
    }

    #[test]
    fn negative_backpressure() {
        let now = Instant::now();
        let addrs = test::dummy_block_socket_addrs(3);
        let mut timer = Timer::new();
        let mut rpc = RpcManager::new(TIMEOUT, 2, GRACE);

        rpc.start(addrs[0], None, ping(), Owner::Ping, now, &mut timer)
            .unwrap();
        rpc.start(addrs[1], None, ping(), Owner::Ping, now, &mut timer)
            .unwrap();

        assert_eq!(
            rpc.start(addrs[2], None, ping(), Owner::Ping, now, &mut timer),
            Err(RpcError::Backpressure)
        );
    }

    #[test]
    fn positive_cancel_owner() {
        let now = Instant::now();
        let addrs = test::dummy_block_socket_addrs(3);
        let mut timer = Timer::new();
        let mut rpc = RpcManager::new(TIMEOUT, 8, GRACE);

        let cancelled = rpc
            .start(addrs[0], None, ping(), Owner::Lookup(1), now, &mut timer)
            .unwrap();
        rpc.start(addrs[1], None, ping(), Owner::Lookup(1), now, &mut timer)
            .unwrap();
        rpc.start(addrs[2], None, ping(), Owner::Lookup(2), now, &mut timer)
            .unwrap();

        assert_eq!(rpc.cancel_owner(Owner::Lookup(1), now, &mut timer), 2);
        assert_eq!(rpc.num_in_flight(), 1);
        assert_eq!(timer.len(), 1);
        assert!(rpc
            .finish(&cancelled.transaction_id, addrs[0], now, &mut timer)
            .is_none());
    }

    #[test]
    fn positive_pending_ping_tracked_per_address() {
        let now = Instant::now();
        let addrs = test::dummy_block_socket_addrs(2);
        let mut timer = Timer::new();
        let mut rpc = RpcManager::new(TIMEOUT, 8, GRACE);

        assert!(!rpc.has_pending(addrs[0], Owner::Ping));

        let message = rpc
            .start(addrs[0], None, ping(), Owner::Ping, now, &mut timer)
            .unwrap();
        rpc.start(addrs[1], None, ping(), Owner::Lookup(1), now, &mut timer)
            .unwrap();

        assert!(rpc.has_pending(addrs[0], Owner::Ping));
        assert!(!rpc.has_pending(addrs[1], Owner::Ping));
        assert!(rpc.has_pending(addrs[1], Owner::Lookup(1)));

        rpc.finish(&message.transaction_id, addrs[0], now, &mut timer)
            .unwrap();
        assert!(!rpc.has_pending(addrs[0], Owner::Ping));
    }
}
