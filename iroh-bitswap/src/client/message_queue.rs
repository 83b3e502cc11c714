use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use libp2p_identity::PeerId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, warn, Instrument};

use crate::{
    error::Error,
    message::{BitswapMessage, Entry},
    metrics::Metrics,
    network::{MessageNetwork, MessageSender},
};

use super::{peer_manager::PeerQueue, wantlist::SessionTrackedWantlist};

#[derive(Debug, Clone)]
pub struct Config {
    /// Depth of the request queue, callers block once it is full.
    pub queue_depth: usize,
    /// Maximum number of attempts to send a single message.
    pub max_retries: usize,
    /// The time to wait before reopening the sender after a failed send,
    /// giving disconnect notifications time to propagate.
    pub send_error_backoff: Duration,
    /// Upper bound for dialing the peer and negotiating the protocol.
    pub connect_timeout: Duration,
    /// Write deadline for a single message.
    pub send_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            queue_depth: 16,
            max_retries: 10,
            send_error_backoff: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10 * 60),
            send_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Queue of want messages to send to a single peer.
///
/// Incoming entries are merged into one pending message, which a separate send loop
/// picks up and delivers, retrying on failures.
///
/// [`MessageQueue::shutdown`] closes the sender gracefully, cancelling the token the
/// queue was created with resets it.
#[derive(Debug)]
pub struct MessageQueue {
    peer: PeerId,
    sender_requests: mpsc::Sender<QueueRequest>,
    cancel: CancellationToken,
    done: CancellationToken,
    workers: Option<(QueueActor, SendActor)>,
    metrics: Arc<Metrics>,
}

#[derive(Debug)]
enum QueueRequest {
    Message {
        entries: Vec<Entry>,
        from: u64,
    },
    Wantlist(SessionTrackedWantlist),
    #[cfg(test)]
    GetState(tokio::sync::oneshot::Sender<(SessionTrackedWantlist, Option<BitswapMessage>)>),
}

impl MessageQueue {
    pub fn new(
        cancel: &CancellationToken,
        peer: PeerId,
        network: Arc<dyn MessageNetwork>,
        config: Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cancel = cancel.child_token();
        let done = CancellationToken::new();
        let (sender_requests, receiver_requests) = mpsc::channel(config.queue_depth);
        // a single slot, so that at most one message waits while another is in flight
        let (sender_outgoing, receiver_outgoing) = mpsc::channel(1);

        let queue = QueueActor {
            peer,
            wantlist: Default::default(),
            next_message: None,
            requests: receiver_requests,
            outgoing: sender_outgoing,
            cancel: cancel.clone(),
            done: done.clone(),
        };
        let send = SendActor {
            peer,
            network,
            config,
            sender: None,
            outgoing: receiver_outgoing,
            cancel: cancel.clone(),
            done: done.clone(),
            metrics: metrics.clone(),
        };

        MessageQueue {
            peer,
            sender_requests,
            cancel,
            done,
            workers: Some((queue, send)),
            metrics,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn is_running(&self) -> bool {
        self.workers.is_none() && !self.done.is_cancelled() && !self.cancel.is_cancelled()
    }

    /// Adds new entries to the outgoing message for the given session.
    pub async fn add_message(&self, entries: Vec<Entry>, from: u64) {
        self.send_request(QueueRequest::Message { entries, from })
            .await;
    }

    /// Seeds the queue with a complete wantlist, used when the peer connects.
    pub async fn add_wantlist(&self, initial_wants: &SessionTrackedWantlist) {
        let mut wantlist = SessionTrackedWantlist::default();
        initial_wants.copy_wants(&mut wantlist);
        self.send_request(QueueRequest::Wantlist(wantlist)).await;
    }

    /// Starts processing messages. Calling it again is a no-op.
    pub fn startup(&mut self) {
        let Some((queue, send)) = self.workers.take() else {
            return;
        };
        self.metrics.message_queues_started.inc();
        let peer = self.peer;
        tokio::task::spawn(queue.run().instrument(debug_span!("message_queue", %peer)));
        tokio::task::spawn(send.run().instrument(debug_span!("message_sender", %peer)));
    }

    /// Stops processing, closing the sender gracefully.
    pub fn shutdown(&self) {
        if !self.done.is_cancelled() {
            self.metrics.message_queues_stopped.inc();
        }
        self.done.cancel();
    }

    async fn send_request(&self, request: QueueRequest) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.done.cancelled() => {}
            res = self.sender_requests.send(request) => {
                if res.is_err() {
                    warn!(peer = %self.peer, "message queue stopped, dropping request");
                }
            }
        }
    }

    #[cfg(test)]
    async fn state(&self) -> (SessionTrackedWantlist, Option<BitswapMessage>) {
        let (s, r) = tokio::sync::oneshot::channel();
        self.send_request(QueueRequest::GetState(s)).await;
        r.await.unwrap()
    }
}

#[async_trait]
impl PeerQueue for MessageQueue {
    async fn add_message(&self, entries: Vec<Entry>, from: u64) {
        MessageQueue::add_message(self, entries, from).await;
    }

    async fn add_wantlist(&self, initial_wants: &SessionTrackedWantlist) {
        MessageQueue::add_wantlist(self, initial_wants).await;
    }

    fn startup(&mut self) {
        MessageQueue::startup(self);
    }

    fn shutdown(&self) {
        MessageQueue::shutdown(self);
    }
}

/// Owns the wantlist sent to the peer and the pending message.
#[derive(Debug)]
struct QueueActor {
    peer: PeerId,
    wantlist: SessionTrackedWantlist,
    next_message: Option<BitswapMessage>,
    requests: mpsc::Receiver<QueueRequest>,
    outgoing: mpsc::Sender<BitswapMessage>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl QueueActor {
    async fn run(mut self) {
        let outgoing = self.outgoing.clone();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.done.cancelled() => break,
                request = self.requests.recv() => {
                    match request {
                        Some(request) => self.handle_request(request),
                        None => break,
                    }
                }
                permit = outgoing.reserve(), if self.next_message.is_some() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(message) = self.next_message.take() {
                                permit.send(message);
                            }
                        }
                        // send loop is gone
                        Err(_) => break,
                    }
                }
            }
        }
        debug!("message queue loop shutting down");
    }

    fn handle_request(&mut self, request: QueueRequest) {
        match request {
            QueueRequest::Message { entries, from } => self.add_entries(&entries, from),
            QueueRequest::Wantlist(initial_wants) => {
                initial_wants.copy_wants(&mut self.wantlist);
                if !initial_wants.is_empty() {
                    let message = self
                        .next_message
                        .get_or_insert_with(|| BitswapMessage::new(false));
                    for entry in initial_wants.entries() {
                        message.add_entry(entry.cid, entry.priority);
                    }
                }
            }
            #[cfg(test)]
            QueueRequest::GetState(response) => {
                let _ = response.send((self.wantlist.clone(), self.next_message.clone()));
            }
        }
    }

    fn add_entries(&mut self, entries: &[Entry], from: u64) {
        for entry in entries {
            if entry.cancel {
                if self.wantlist.remove(&entry.cid, from) {
                    self.next_message
                        .get_or_insert_with(|| BitswapMessage::new(false))
                        .cancel(entry.cid);
                }
            } else if self.wantlist.add(entry.cid, entry.priority, from) {
                self.next_message
                    .get_or_insert_with(|| BitswapMessage::new(false))
                    .add_entry(entry.cid, entry.priority);
            }
        }
        if let Some(ref message) = self.next_message {
            debug!(peer = %self.peer, "pending message has {} entries", message.len());
        }
    }
}

/// Owns the message sender and delivers dequeued messages.
#[derive(Debug)]
struct SendActor {
    peer: PeerId,
    network: Arc<dyn MessageNetwork>,
    config: Config,
    sender: Option<Box<dyn MessageSender>>,
    outgoing: mpsc::Receiver<BitswapMessage>,
    cancel: CancellationToken,
    done: CancellationToken,
    metrics: Arc<Metrics>,
}

enum SendOutcome {
    Sent,
    Failed(anyhow::Error),
    /// The queue was cancelled or shut down, the sender has been released.
    Stopped,
}

impl SendActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.reset_sender().await;
                    break;
                }
                _ = self.done.cancelled() => {
                    self.close_sender().await;
                    break;
                }
                message = self.outgoing.recv() => {
                    match message {
                        Some(message) => self.send_message(message).await,
                        None => break,
                    }
                }
            }
        }
        debug!("message sender loop shutting down");
    }

    async fn send_message(&mut self, message: BitswapMessage) {
        for attempt in 1..=self.config.max_retries {
            if let Err(err) = self.initialize_sender().await {
                if self.is_stopped() {
                    return;
                }
                debug!(peer = %self.peer, "cant open message sender: {:?}", err);
                self.metrics.messages_dropped.inc();
                return;
            }

            let err = match self.attempt_send(&message).await {
                SendOutcome::Sent => {
                    self.metrics.messages_sent.inc();
                    return;
                }
                SendOutcome::Stopped => return,
                SendOutcome::Failed(err) => err,
            };

            self.metrics.send_errors.inc();
            if self.cancel.is_cancelled() {
                self.reset_sender().await;
                return;
            }
            if self.done.is_cancelled() {
                self.close_sender().await;
                return;
            }
            if let Some(Error::UnsupportedMessage { .. }) = err.downcast_ref::<Error>() {
                error!(peer = %self.peer, "dropping message: {}", err);
                self.reset_sender().await;
                self.metrics.messages_dropped.inc();
                return;
            }

            debug!(peer = %self.peer, attempt, "send error: {:?}", err);
            self.reset_sender().await;
            if attempt == self.config.max_retries {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = self.done.cancelled() => return,
                // wait in case disconnect notifications are still propagating
                _ = tokio::time::sleep(self.config.send_error_backoff) => {}
            }
        }

        warn!(
            peer = %self.peer,
            "giving up on message after {} attempts",
            self.config.max_retries
        );
        self.metrics.messages_dropped.inc();
    }

    async fn attempt_send(&mut self, message: &BitswapMessage) -> SendOutcome {
        let Some(sender) = self.sender.as_mut() else {
            return SendOutcome::Failed(Error::Unreachable(self.peer).into());
        };

        let send_timeout = self.config.send_timeout;
        let peer = self.peer;
        let res = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Interrupted::Cancel,
            _ = self.done.cancelled() => Interrupted::Shutdown,
            res = tokio::time::timeout(send_timeout, sender.send_msg(message)) => Interrupted::Completed(res),
        };

        match res {
            Interrupted::Cancel => {
                // the write is abandoned, the stream can not be closed cleanly
                self.reset_sender().await;
                SendOutcome::Stopped
            }
            Interrupted::Shutdown => {
                self.close_sender().await;
                SendOutcome::Stopped
            }
            Interrupted::Completed(Ok(Ok(()))) => SendOutcome::Sent,
            Interrupted::Completed(Ok(Err(err))) => SendOutcome::Failed(err),
            Interrupted::Completed(Err(_elapsed)) => SendOutcome::Failed(
                Error::SendTimeout {
                    peer,
                    timeout: send_timeout,
                }
                .into(),
            ),
        }
    }

    async fn initialize_sender(&mut self) -> Result<()> {
        if self.sender.is_some() {
            return Ok(());
        }
        let sender = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled.into()),
            _ = self.done.cancelled() => return Err(Error::Cancelled.into()),
            sender = open_sender(&*self.network, self.peer, self.config.connect_timeout) => sender?,
        };
        self.metrics.senders_opened.inc();
        self.sender = Some(sender);
        Ok(())
    }

    fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.done.is_cancelled()
    }

    async fn reset_sender(&mut self) {
        if let Some(mut sender) = self.sender.take() {
            if let Err(err) = sender.reset().await {
                debug!(peer = %self.peer, "failed to reset sender: {:?}", err);
            }
        }
    }

    async fn close_sender(&mut self) {
        if let Some(mut sender) = self.sender.take() {
            if let Err(err) = sender.close().await {
                debug!(peer = %self.peer, "failed to close sender: {:?}", err);
            }
        }
    }
}

/// Result of a send raced against the queue stopping.
enum Interrupted<T> {
    Cancel,
    Shutdown,
    Completed(T),
}

async fn open_sender(
    network: &dyn MessageNetwork,
    peer: PeerId,
    connect_timeout: Duration,
) -> Result<Box<dyn MessageSender>> {
    // the timeout covers dialing the peer and negotiating the stream
    let open = async {
        network.connect_to(peer).await?;
        network.new_message_sender(peer).await
    };
    tokio::time::timeout(connect_timeout, open)
        .await
        .map_err(|_| Error::ConnectTimeout {
            peer,
            timeout: connect_timeout,
        })?
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use cid::Cid;
    use tracing_test::traced_test;

    use super::*;
    use crate::test_utils::gen_cids;

    #[derive(Debug, Default)]
    struct SenderLog {
        opened: AtomicUsize,
        sent: Mutex<Vec<BitswapMessage>>,
        attempts: AtomicUsize,
        closed: AtomicUsize,
        reset: AtomicUsize,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Behaviour {
        Succeed,
        Fail,
        Hang,
    }

    #[derive(Debug)]
    struct TestNetwork {
        behaviour: Behaviour,
        log: Arc<SenderLog>,
    }

    #[derive(Debug)]
    struct TestSender {
        behaviour: Behaviour,
        log: Arc<SenderLog>,
    }

    #[async_trait]
    impl MessageNetwork for TestNetwork {
        async fn connect_to(&self, _peer: PeerId) -> Result<()> {
            Ok(())
        }

        async fn new_message_sender(&self, _peer: PeerId) -> Result<Box<dyn MessageSender>> {
            self.log.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(TestSender {
                behaviour: self.behaviour,
                log: self.log.clone(),
            }))
        }
    }

    #[async_trait]
    impl MessageSender for TestSender {
        async fn send_msg(&mut self, message: &BitswapMessage) -> Result<()> {
            self.log.attempts.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => {
                    self.log.sent.lock().unwrap().push(message.clone());
                    Ok(())
                }
                Behaviour::Fail => anyhow::bail!("stream reset by peer"),
                Behaviour::Hang => futures::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<()> {
            self.log.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reset(&mut self) -> Result<()> {
            self.log.reset.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Connects fine, but never finishes negotiating a stream.
    #[derive(Debug)]
    struct StalledNegotiation(Arc<SenderLog>);

    #[async_trait]
    impl MessageNetwork for StalledNegotiation {
        async fn connect_to(&self, _peer: PeerId) -> Result<()> {
            Ok(())
        }

        async fn new_message_sender(&self, _peer: PeerId) -> Result<Box<dyn MessageSender>> {
            self.0.opened.fetch_add(1, Ordering::SeqCst);
            futures::future::pending().await
        }
    }

    fn new_queue(
        cancel: &CancellationToken,
        behaviour: Behaviour,
    ) -> (MessageQueue, Arc<SenderLog>) {
        new_queue_with_config(cancel, behaviour, Config::default())
    }

    fn new_queue_with_config(
        cancel: &CancellationToken,
        behaviour: Behaviour,
        config: Config,
    ) -> (MessageQueue, Arc<SenderLog>) {
        let log = Arc::new(SenderLog::default());
        let network = Arc::new(TestNetwork {
            behaviour,
            log: log.clone(),
        });
        let mq = MessageQueue::new(
            cancel,
            PeerId::random(),
            network,
            config,
            Default::default(),
        );
        (mq, log)
    }

    /// Only the test and, while the send loop runs, the network hold the log.
    fn send_loop_exited(log: &Arc<SenderLog>) -> bool {
        Arc::strong_count(log) == 1
    }

    fn wants(cids: &[Cid]) -> Vec<Entry> {
        cids.iter()
            .enumerate()
            .map(|(i, c)| Entry::want(*c, 100 - i as i32))
            .collect()
    }

    fn cancels(cids: &[Cid]) -> Vec<Entry> {
        cids.iter().map(|c| Entry::cancel(*c)).collect()
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(60), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_merges_entries_into_pending_message() {
        let cancel = CancellationToken::new();
        let (mq, _log) = new_queue(&cancel, Behaviour::Succeed);
        let mut worker = mq_without_sender(mq);
        let cids = gen_cids(3);

        worker.add_entries(&wants(&cids), 1);
        // another session wanting the same cid does not produce a new entry
        worker.next_message = None;
        worker.add_entries(&wants(&cids[..1]), 2);
        assert!(worker.next_message.is_none());

        // the first session cancelling is suppressed
        worker.add_entries(&cancels(&cids[..1]), 1);
        assert!(worker.next_message.is_none());

        // the last one goes out
        worker.add_entries(&cancels(&cids[..1]), 2);
        let message = worker.next_message.take().unwrap();
        assert_eq!(message.len(), 1);
        assert!(message.get(&cids[0]).unwrap().cancel);

        // redundant cancels are dropped
        worker.add_entries(&cancels(&cids[..1]), 2);
        assert!(worker.next_message.is_none());
        assert_eq!(worker.wantlist.len(), 2);
    }

    fn mq_without_sender(mut mq: MessageQueue) -> QueueActor {
        mq.workers.take().unwrap().0
    }

    #[tokio::test]
    async fn test_add_wantlist_seeds_message() {
        let cancel = CancellationToken::new();
        let (mq, _log) = new_queue(&cancel, Behaviour::Succeed);
        let cids = gen_cids(3);

        let mut initial = SessionTrackedWantlist::default();
        for (i, cid) in cids.iter().enumerate() {
            initial.add(*cid, 10 - i as i32, 1);
        }
        mq.add_wantlist(&initial).await;

        let mut worker = mq_without_sender(mq);
        let request = worker.requests.recv().await.unwrap();
        worker.handle_request(request);
        assert_eq!(worker.wantlist.len(), 3);
        let message = worker.next_message.take().unwrap();
        assert_eq!(message.len(), 3);
        assert!(!message.full());
        assert!(message.wantlist().all(|e| !e.cancel));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_sends_messages() {
        let cancel = CancellationToken::new();
        let (mut mq, log) = new_queue(&cancel, Behaviour::Succeed);
        let cids = gen_cids(4);
        mq.startup();
        assert!(mq.is_running());

        let mut initial = SessionTrackedWantlist::default();
        initial.add(cids[0], 10, 1);
        mq.add_wantlist(&initial).await;
        mq.add_message(wants(&cids[1..]), 1).await;

        wait_for(|| {
            let sent = log.sent.lock().unwrap();
            sent.iter().map(|m| m.len()).sum::<usize>() == 4
        })
        .await;
        let (wantlist, pending) = mq.state().await;
        assert_eq!(wantlist.len(), 4);
        assert!(pending.is_none());

        mq.add_message(cancels(&cids[..2]), 1).await;
        wait_for(|| {
            let sent = log.sent.lock().unwrap();
            sent.iter()
                .flat_map(|m| m.wantlist())
                .filter(|e| e.cancel)
                .count()
                == 2
        })
        .await;

        // only a single sender was needed
        assert_eq!(log.opened.load(Ordering::SeqCst), 1);

        mq.shutdown();
        assert!(!mq.is_running());
        wait_for(|| log.closed.load(Ordering::SeqCst) == 1).await;
        assert_eq!(log.reset.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retries_with_fresh_senders() {
        let cancel = CancellationToken::new();
        let (mut mq, log) = new_queue(&cancel, Behaviour::Fail);
        let cids = gen_cids(2);
        mq.startup();

        mq.add_message(wants(&cids[..1]), 1).await;
        wait_for(|| log.attempts.load(Ordering::SeqCst) == 10).await;
        // let the loop settle, nothing else may happen for this message
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(log.attempts.load(Ordering::SeqCst), 10);
        assert_eq!(log.opened.load(Ordering::SeqCst), 10);
        assert_eq!(log.reset.load(Ordering::SeqCst), 10);

        // the queue is still alive and opens a fresh sender
        mq.add_message(wants(&cids[1..]), 1).await;
        wait_for(|| log.attempts.load(Ordering::SeqCst) == 20).await;
        assert_eq!(log.opened.load(Ordering::SeqCst), 20);
        assert!(mq.is_running());
    }

    #[tokio::test]
    async fn test_cancel_resets_blocked_sender() {
        let cancel = CancellationToken::new();
        let (mut mq, log) = new_queue(&cancel, Behaviour::Hang);
        let cids = gen_cids(1);
        mq.startup();

        mq.add_message(wants(&cids), 1).await;
        wait_for(|| log.attempts.load(Ordering::SeqCst) == 1).await;

        cancel.cancel();
        wait_for(|| log.reset.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.reset.load(Ordering::SeqCst), 1);
        assert_eq!(log.closed.load(Ordering::SeqCst), 0);
        assert!(!mq.is_running());
    }

    #[tokio::test]
    async fn test_unsupported_message_is_not_retried() {
        #[derive(Debug)]
        struct Rejecting(Arc<SenderLog>);

        #[async_trait]
        impl MessageSender for Rejecting {
            async fn send_msg(&mut self, _message: &BitswapMessage) -> Result<()> {
                self.0.attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::UnsupportedMessage {
                    peer: PeerId::random(),
                    reason: "test".into(),
                }
                .into())
            }

            async fn close(&mut self) -> Result<()> {
                Ok(())
            }

            async fn reset(&mut self) -> Result<()> {
                self.0.reset.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        #[derive(Debug)]
        struct RejectingNetwork(Arc<SenderLog>);

        #[async_trait]
        impl MessageNetwork for RejectingNetwork {
            async fn connect_to(&self, _peer: PeerId) -> Result<()> {
                Ok(())
            }

            async fn new_message_sender(&self, _peer: PeerId) -> Result<Box<dyn MessageSender>> {
                self.0.opened.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(Rejecting(self.0.clone())))
            }
        }

        let cancel = CancellationToken::new();
        let log = Arc::new(SenderLog::default());
        let mut mq = MessageQueue::new(
            &cancel,
            PeerId::random(),
            Arc::new(RejectingNetwork(log.clone())),
            Config::default(),
            Default::default(),
        );
        mq.startup();
        mq.add_message(wants(&gen_cids(1)), 1).await;

        wait_for(|| log.reset.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(log.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(log.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        #[derive(Debug)]
        struct Unreachable;

        #[async_trait]
        impl MessageNetwork for Unreachable {
            async fn connect_to(&self, _peer: PeerId) -> Result<()> {
                futures::future::pending().await
            }

            async fn new_message_sender(&self, _peer: PeerId) -> Result<Box<dyn MessageSender>> {
                unreachable!("never connected")
            }
        }

        let peer = PeerId::random();
        let err = open_sender(&Unreachable, peer, Duration::from_secs(600))
            .await
            .unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::ConnectTimeout { peer: p, .. }) => assert_eq!(*p, peer),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_covers_negotiation() {
        let log = Arc::new(SenderLog::default());
        let peer = PeerId::random();
        let err = open_sender(
            &StalledNegotiation(log.clone()),
            peer,
            Duration::from_secs(600),
        )
        .await
        .unwrap_err();
        assert_eq!(log.opened.load(Ordering::SeqCst), 1);
        match err.downcast_ref::<Error>() {
            Some(Error::ConnectTimeout { peer: p, timeout }) => {
                assert_eq!(*p, peer);
                assert_eq!(*timeout, Duration::from_secs(600));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_shutdown_closes_blocked_sender() {
        let cancel = CancellationToken::new();
        let (mut mq, log) = new_queue(&cancel, Behaviour::Hang);
        mq.startup();

        mq.add_message(wants(&gen_cids(1)), 1).await;
        wait_for(|| log.attempts.load(Ordering::SeqCst) == 1).await;

        mq.shutdown();
        wait_for(|| log.closed.load(Ordering::SeqCst) == 1).await;
        wait_for(|| send_loop_exited(&log)).await;
        assert_eq!(log.reset.load(Ordering::SeqCst), 0);
        assert_eq!(log.closed.load(Ordering::SeqCst), 1);
        assert!(!mq.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff_stops_retrying() {
        let cancel = CancellationToken::new();
        let config = Config {
            send_error_backoff: Duration::from_secs(30),
            ..Default::default()
        };
        let (mut mq, log) = new_queue_with_config(&cancel, Behaviour::Fail, config);
        mq.startup();

        mq.add_message(wants(&gen_cids(1)), 1).await;
        // the failed sender is reset before backing off
        wait_for(|| log.reset.load(Ordering::SeqCst) == 1).await;

        mq.shutdown();
        wait_for(|| send_loop_exited(&log)).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(log.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(log.opened.load(Ordering::SeqCst), 1);
        assert_eq!(log.reset.load(Ordering::SeqCst), 1);
        assert_eq!(log.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_stalled_open() {
        let cancel = CancellationToken::new();
        let log = Arc::new(SenderLog::default());
        let metrics = Arc::new(Metrics::default());
        let mut mq = MessageQueue::new(
            &cancel,
            PeerId::random(),
            Arc::new(StalledNegotiation(log.clone())),
            Config::default(),
            metrics.clone(),
        );
        mq.startup();

        mq.add_message(wants(&gen_cids(1)), 1).await;
        wait_for(|| log.opened.load(Ordering::SeqCst) == 1).await;

        // well before the connect timeout
        mq.shutdown();
        wait_for(|| send_loop_exited(&log)).await;
        assert_eq!(log.opened.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.messages_dropped.get(), 0);
        assert_eq!(metrics.senders_opened.get(), 0);
    }

    #[tokio::test]
    async fn test_queue_is_shared_across_tasks() {
        let cancel = CancellationToken::new();
        let (mut mq, log) = new_queue(&cancel, Behaviour::Succeed);
        mq.startup();
        let queue: Arc<dyn PeerQueue> = Arc::new(mq);
        let cids = gen_cids(2);

        let tasks: Vec<_> = cids
            .iter()
            .map(|cid| {
                let queue = queue.clone();
                let entries = wants(&[*cid]);
                tokio::task::spawn(async move { queue.add_message(entries, 1).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        wait_for(|| {
            let sent = log.sent.lock().unwrap();
            sent.iter().map(|m| m.len()).sum::<usize>() == 2
        })
        .await;
        queue.shutdown();
        wait_for(|| log.closed.load(Ordering::SeqCst) == 1).await;
    }
}
