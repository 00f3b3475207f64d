use crate::{
    error::DhtError,
    worker::{LookupId, OneshotTask, SearchEvent},
};
use futures_util::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::mpsc;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Running,
    Done,
    Cancelled,
}

/// A running `get_peers` or `announce` lookup.
///
/// Yields [`SearchEvent::Peer`] for every peer as soon as it is discovered and
/// [`SearchEvent::Done`] once at the end. Dropping the search cancels the lookup.
pub struct Search {
    id: LookupId,
    rx: mpsc::UnboundedReceiver<SearchEvent>,
    send: mpsc::UnboundedSender<OneshotTask>,
    state: State,
}

impl Search {
    pub(crate) fn new(
        id: LookupId,
        rx: mpsc::UnboundedReceiver<SearchEvent>,
        send: mpsc::UnboundedSender<OneshotTask>,
    ) -> Self {
        Self {
            id,
            rx,
            send,
            state: State::Running,
        }
    }

    /// Abort the lookup. Nothing is yielded afterwards.
    pub fn cancel(&mut self) -> Result<(), DhtError> {
        match self.state {
            State::Cancelled => Err(DhtError::AlreadyCancelled),
            State::Done => {
                self.state = State::Cancelled;
                Ok(())
            }
            State::Running => {
                self.state = State::Cancelled;
                self.rx.close();
                // The worker being gone means the lookup is gone too.
                self.send
                    .send(OneshotTask::CancelLookup(self.id))
                    .unwrap_or(());
                Ok(())
            }
        }
    }
}

impl Stream for Search {
    type Item = SearchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.state != State::Running {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if let SearchEvent::Done(_) = event {
                    self.state = State::Done;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                // The worker went away without finishing the lookup.
                self.state = State::Done;
                Poll::Ready(Some(SearchEvent::Done(Err(DhtError::Shutdown))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Search {
    fn drop(&mut self) {
        if self.state == State::Running {
            self.cancel().unwrap_or(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::LookupSummary;
    use futures_util::StreamExt;

    fn search() -> (
        Search,
        mpsc::UnboundedSender<SearchEvent>,
        mpsc::UnboundedReceiver<OneshotTask>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        (Search::new(7, event_rx, command_tx), event_tx, command_rx)
    }

    #[tokio::test]
    async fn positive_done_is_last_event() {
        let (mut search, tx, mut commands) = search();
        let peer = crate::test::dummy_socket_addr_v4();

        tx.send(SearchEvent::Peer(peer)).unwrap();
        tx.send(SearchEvent::Done(Ok(LookupSummary::default()))).unwrap();

        assert!(matches!(search.next().await, Some(SearchEvent::Peer(addr)) if addr == peer));
        assert!(matches!(search.next().await, Some(SearchEvent::Done(Ok(_)))));
        assert!(search.next().await.is_none());

        // Finished searches are not cancelled on drop.
        drop(search);
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn negative_double_cancel() {
        let (mut search, tx, mut commands) = search();

        assert!(search.cancel().is_ok());
        assert!(matches!(search.cancel(), Err(DhtError::AlreadyCancelled)));
        assert!(matches!(commands.try_recv(), Ok(OneshotTask::CancelLookup(7))));

        // Events sent after the cancel are not delivered.
        tx.send(SearchEvent::Peer(crate::test::dummy_socket_addr_v4()))
            .unwrap_or(());
        assert!(search.next().await.is_none());
    }

    #[tokio::test]
    async fn negative_worker_gone_reports_shutdown() {
        let (mut search, tx, _commands) = search();
        drop(tx);

        assert!(matches!(
            search.next().await,
            Some(SearchEvent::Done(Err(DhtError::Shutdown)))
        ));
        assert!(search.next().await.is_none());
    }

    #[tokio::test]
    async fn positive_drop_cancels_running_search() {
        let (search, _tx, mut commands) = search();
        drop(search);

        assert!(matches!(commands.try_recv(), Ok(OneshotTask::CancelLookup(7))));
    }
}
