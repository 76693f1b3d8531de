//! TCP controller: accept loop and per-connection handler.
//!
//! Each accepted connection runs a [`ConnectionHandler`] on its own task:
//! handshake, survey, identification, the handshake acknowledgement, then a
//! strict send-task / await-response drain of the agent's queue. Failures end
//! only the affected connection.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::command::{Command, Response, ResponseOutcome};
use crate::config::ControllerConfig;
use crate::error::{NestError, NestResult, ProtocolResult, SessionError};
use crate::protocol::{ChunkTransport, Cipher, Frame, FrameCodec, negotiate};
use crate::session::{AgentSession, SessionRegistry, SessionState};
use crate::store::{Agent, AgentStore};

/// How a connection ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The queue ran empty.
    Drained { agent: String, completed: usize },
    /// Shutdown was requested between tasks.
    Interrupted { agent: String, completed: usize },
    Aborted(NestError),
}

/// How the sessions of one [`Controller::serve`] call ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeReport {
    pub drained: usize,
    pub interrupted: usize,
    pub aborted: usize,
    /// Still running when the grace period ran out.
    pub cancelled: usize,
}

impl ServeReport {
    fn record(&mut self, joined: Result<SessionOutcome, tokio::task::JoinError>) {
        match joined {
            Ok(SessionOutcome::Drained { agent, completed }) => {
                self.drained += 1;
                tracing::info!(%agent, completed, "session drained");
            }
            Ok(SessionOutcome::Interrupted { agent, completed }) => {
                self.interrupted += 1;
                tracing::info!(%agent, completed, "session interrupted");
            }
            Ok(SessionOutcome::Aborted(_)) => self.aborted += 1,
            Err(e) if e.is_cancelled() => self.cancelled += 1,
            Err(e) => {
                self.aborted += 1;
                tracing::error!(error = %e, "session task panicked");
            }
        }
    }
}

/// Drives one agent connection from handshake to drain.
pub struct ConnectionHandler<S> {
    stream: S,
    peer: String,
    store: AgentStore,
    sessions: SessionRegistry,
    config: Arc<ControllerConfig>,
    codec: FrameCodec,
    chunks: ChunkTransport,
    inbound: Cipher,
    outbound: Cipher,
    session: AgentSession,
    shutdown: watch::Receiver<bool>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: impl Into<String>,
        store: AgentStore,
        sessions: SessionRegistry,
        config: Arc<ControllerConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> NestResult<Self> {
        let codec = FrameCodec::new(config.transport.max_frame_size);
        let chunks = ChunkTransport::new(config.transport.max_chunk_size)?;
        Ok(Self {
            stream,
            peer: peer.into(),
            store,
            sessions,
            config,
            codec,
            chunks,
            inbound: Cipher::none(),
            outbound: Cipher::none(),
            session: AgentSession::new(),
            shutdown,
        })
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Run the session to completion inside a span for this peer.
    pub async fn run(mut self) -> SessionOutcome {
        let span = tracing::info_span!(
            "connection",
            peer = %self.peer,
            agent = tracing::field::Empty
        );
        async move {
            tracing::info!("connection accepted");
            match self.drive().await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.session.abort();
                    tracing::error!(error = %err, "session aborted");
                    SessionOutcome::Aborted(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self) -> NestResult<SessionOutcome> {
        let negotiated = negotiate(&mut self.stream, &self.config.handshake).await?;
        self.inbound = negotiated.inbound;
        self.outbound = negotiated.outbound;
        self.session.advance(SessionState::CipherNegotiated)?;

        let survey = match self.receive().await? {
            Some(survey) => survey,
            None => return Err(SessionError::NoSurvey.into()),
        };
        tracing::debug!(survey = %survey.metadata, "survey received");
        self.session.advance(SessionState::SurveyReceived)?;

        let agent = self.store.resolve_or_create_agent(&survey.metadata)?;
        tracing::Span::current().record("agent", agent.id.as_str());
        let _claim = self.sessions.claim(&agent.id, &self.peer)?;
        self.session.identify(agent.id.clone())?;

        self.send(&Command::handshake().for_agent(agent.id.as_str())).await?;
        self.session.advance(SessionState::Ready)?;

        self.drain(&agent).await
    }

    /// Deliver pending tasks one at a time until none are left.
    async fn drain(&mut self, agent: &Agent) -> NestResult<SessionOutcome> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(self.interrupt(agent).await);
            }

            // Re-read every round so tasks submitted mid-drain are picked up.
            let next = self
                .store
                .pending_tasks(agent)?
                .into_iter()
                .find(|task| !self.session.was_delivered(task.id()));
            let Some(mut command) = next else {
                self.session.advance(SessionState::Drained)?;
                tracing::info!(
                    delivered = self.session.delivered_count(),
                    completed = self.session.completed_count(),
                    "no more tasks"
                );
                return Ok(SessionOutcome::Drained {
                    agent: agent.id.clone(),
                    completed: self.session.completed_count(),
                });
            };

            self.session.advance(SessionState::Tasking)?;
            self.send(&command).await?;
            self.session.mark_delivered(command.id());
            self.session.advance(SessionState::AwaitingResponse)?;

            let Some(response) = self.receive().await? else {
                tracing::warn!(command = %command.id(), "no content in reply, task left pending");
                continue;
            };
            let outcome = command.submit_response(response, &self.store, agent)?;
            if let ResponseOutcome::Failed { .. } = outcome {
                self.store.fail_task(agent, &command)?;
            } else {
                self.store.complete_task(agent, &command)?;
                self.session.mark_completed();
            }
            log_outcome(&command, &outcome);
        }
    }

    /// Pause, then end the session.
    async fn interrupt(&mut self, agent: &Agent) -> SessionOutcome {
        let pause = self.config.session_pause();
        tracing::warn!(
            pause_ms = pause.as_millis() as u64,
            "terminating connection at operator request"
        );
        tokio::time::sleep(pause).await;
        self.session.abort();
        SessionOutcome::Interrupted {
            agent: agent.id.clone(),
            completed: self.session.completed_count(),
        }
    }

    async fn send(&mut self, command: &Command) -> ProtocolResult<()> {
        let envelope = command.envelope();
        tracing::info!(command = %command.id(), verb = command.verb(), "tasking");
        tracing::debug!(%envelope, "outbound envelope");
        self.codec
            .write_envelope(&mut self.stream, &mut self.outbound, &envelope)
            .await?;
        if let Some(payload) = command.streamed_payload() {
            self.chunks
                .send_chunks(&mut self.stream, &mut self.outbound, payload)
                .await?;
        }
        Ok(())
    }

    /// Next message from the agent, with its chunked payload if declared.
    async fn receive(&mut self) -> ProtocolResult<Option<Response>> {
        let envelope = match self.codec.decode(&mut self.stream, &mut self.inbound).await? {
            Frame::NoContent => return Ok(None),
            Frame::Message(envelope) => envelope,
        };
        tracing::debug!(%envelope, "inbound envelope");
        let data = if envelope.is_chunked() {
            let cap = self.config.transport.max_frame_size;
            ChunkTransport::receive_chunks(&mut self.stream, &mut self.inbound, cap).await?
        } else {
            Vec::new()
        };
        Ok(Some(Response::new(envelope, data)))
    }
}

fn log_outcome(command: &Command, outcome: &ResponseOutcome) {
    match outcome {
        ResponseOutcome::Acknowledged => {
            tracing::info!(command = %command.id(), "acknowledged");
        }
        ResponseOutcome::Collected { path } | ResponseOutcome::TunnelRecorded { path } => {
            tracing::info!(command = %command.id(), path = %path.display(), "response stored");
        }
        ResponseOutcome::Output { text, encoding } => {
            tracing::info!(command = %command.id(), ?encoding, "output:\n{text}");
        }
        ResponseOutcome::Failed { reason } => {
            tracing::warn!(command = %command.id(), %reason, "response not handled, task failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Accepts agent connections and runs one handler task per connection.
#[derive(Debug, Clone)]
pub struct Controller {
    config: Arc<ControllerConfig>,
    store: AgentStore,
    sessions: SessionRegistry,
}

impl Controller {
    pub fn new(config: ControllerConfig, store: AgentStore) -> Self {
        Self {
            config: Arc::new(config),
            store,
            sessions: SessionRegistry::new(),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "controller listening");
        Ok(listener)
    }

    /// Serve until `shutdown` flips to `true`.
    ///
    /// Sessions see the same flag between tasks and pause for
    /// [`ControllerConfig::session_pause`]. After the accept loop stops,
    /// sessions get the full grace period to finish; the rest are aborted.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> ServeReport {
        let mut report = ServeReport::default();
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(%peer, error = %e, "set_nodelay failed");
                        }
                        match ConnectionHandler::new(
                            stream,
                            peer.to_string(),
                            self.store.clone(),
                            self.sessions.clone(),
                            Arc::clone(&self.config),
                            shutdown.clone(),
                        ) {
                            Ok(handler) => {
                                sessions.spawn(handler.run());
                            }
                            Err(e) => tracing::error!(%peer, error = %e, "cannot start session"),
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("shutdown requested, no longer accepting");
                        break;
                    }
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    report.record(joined);
                }
            }
        }

        for (agent, live) in self.sessions.live() {
            tracing::info!(%agent, peer = %live.peer, since = %live.since, "waiting for session");
        }
        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = sessions.join_next().await {
                report.record(joined);
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = sessions.len(), "grace period over, aborting sessions");
            sessions.abort_all();
            while let Some(joined) = sessions.join_next().await {
                report.record(joined);
            }
        }
        tracing::info!(
            drained = report.drained,
            interrupted = report.interrupted,
            aborted = report.aborted,
            cancelled = report.cancelled,
            "controller stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandRegistry, Execute};
    use crate::error::{CommandError, ProtocolError, StoreError};
    use crate::paths::NestPaths;
    use crate::protocol::Envelope;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const HELLO: [u8; 6] = [0x75, 0x63, 0x65, 0x73, 0x00, 0x00];

    fn store(dir: &TempDir) -> AgentStore {
        AgentStore::open(
            NestPaths::rooted(dir.path()),
            Arc::new(CommandRegistry::with_builtins()),
        )
        .unwrap()
    }

    fn handler(
        stream: DuplexStream,
        store: AgentStore,
        sessions: SessionRegistry,
    ) -> (ConnectionHandler<DuplexStream>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let handler = ConnectionHandler::new(
            stream,
            "test-peer",
            store,
            sessions,
            Arc::new(ControllerConfig::default()),
            rx,
        )
        .unwrap();
        (handler, tx)
    }

    async fn write_frame(stream: &mut DuplexStream, envelope: &Envelope) {
        let wire = FrameCodec::default().encode(&envelope.to_bytes(), &mut Cipher::none());
        stream.write_all(&wire).await.unwrap();
    }

    async fn read_frame(stream: &mut DuplexStream) -> Frame {
        FrameCodec::default()
            .decode(stream, &mut Cipher::none())
            .await
            .unwrap()
    }

    fn survey(id: &str) -> Envelope {
        Envelope::new("survey").with_header("Trojan-ID", id)
    }

    /// Agent side up to and including the handshake acknowledgement.
    async fn check_in(agent: &mut DuplexStream, id: &str) {
        agent.write_all(&HELLO).await.unwrap();
        write_frame(agent, &survey(id)).await;
        let mut reply = [0u8; 6];
        agent.read_exact(&mut reply).await.unwrap();
        let ack = read_frame(agent).await.into_envelope().unwrap();
        assert_eq!(ack.uri, "handshake");
    }

    /// One queued `id` task for agent `abc123`, and a handler draining it.
    async fn tasked_session(
        dir: &TempDir,
    ) -> (AgentStore, Agent, Command, DuplexStream, tokio::task::JoinHandle<SessionOutcome>) {
        let store = store(dir);
        let agent_rec = store.resolve_or_create_agent(&survey("abc123")).unwrap();
        let cmd = Command::new(Execute::new("id"));
        store.submit_task(&agent_rec, &cmd).unwrap();

        let (controller, mut agent) = tokio::io::duplex(4096);
        let (handler, tx) = handler(controller, store.clone(), SessionRegistry::new());
        let task = tokio::spawn(async move {
            let outcome = handler.run().await;
            drop(tx);
            outcome
        });
        check_in(&mut agent, "abc123").await;
        let tasked = read_frame(&mut agent).await.into_envelope().unwrap();
        assert_eq!(tasked.header_str("Command-Line"), Some("id"));
        (store, agent_rec, cmd, agent, task)
    }

    fn assert_still_pending(store: &AgentStore, agent: &Agent, cmd: &Command) {
        let pending = store.pending_tasks(agent).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id(), cmd.id());
        assert!(store.responses(agent).unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_survey_aborts() {
        let dir = TempDir::new().unwrap();
        let (controller, mut agent) = tokio::io::duplex(1024);
        let (handler, _tx) = handler(controller, store(&dir), SessionRegistry::new());
        let task = tokio::spawn(handler.run());

        agent.write_all(&HELLO).await.unwrap();
        agent.write_all(&[0, 0, 0, 0]).await.unwrap();

        let outcome = task.await.unwrap();
        assert!(matches!(
            outcome,
            SessionOutcome::Aborted(NestError::Session(SessionError::NoSurvey))
        ));
    }

    #[tokio::test]
    async fn empty_queue_drains_after_handshake() {
        let dir = TempDir::new().unwrap();
        let (controller, mut agent) = tokio::io::duplex(1024);
        let (handler, _tx) = handler(controller, store(&dir), SessionRegistry::new());
        let task = tokio::spawn(handler.run());

        agent.write_all(&HELLO).await.unwrap();
        write_frame(&mut agent, &survey("abc123")).await;

        let mut reply = [0u8; 6];
        agent.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x75, 0x63, 0x65, 0x73, 0x01, 0x00]);
        let ack = read_frame(&mut agent).await.into_envelope().unwrap();
        assert_eq!(ack.uri, "handshake");

        match task.await.unwrap() {
            SessionOutcome::Drained { agent, completed } => {
                assert_eq!(agent, "abc123");
                assert_eq!(completed, 0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn controller_hello_arrives_before_survey_is_sent() {
        let dir = TempDir::new().unwrap();
        let (controller, mut agent) = tokio::io::duplex(1024);
        let (handler, _tx) = handler(controller, store(&dir), SessionRegistry::new());
        let task = tokio::spawn(handler.run());

        agent.write_all(&HELLO).await.unwrap();
        let mut reply = [0u8; 6];
        tokio::time::timeout(std::time::Duration::from_secs(5), agent.read_exact(&mut reply))
            .await
            .expect("controller hello before any survey")
            .unwrap();
        assert_eq!(reply, [0x75, 0x63, 0x65, 0x73, 0x01, 0x00]);

        write_frame(&mut agent, &survey("abc123")).await;
        let ack = read_frame(&mut agent).await.into_envelope().unwrap();
        assert_eq!(ack.uri, "handshake");
        assert!(matches!(task.await.unwrap(), SessionOutcome::Drained { completed: 0, .. }));
    }

    #[tokio::test]
    async fn no_content_reply_leaves_task_pending() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let agent_rec = store.resolve_or_create_agent(&survey("abc123")).unwrap();
        let cmd = Command::new(Execute::new("sleep 1"));
        store.submit_task(&agent_rec, &cmd).unwrap();

        let (controller, mut agent) = tokio::io::duplex(4096);
        let (handler, _tx) = handler(controller, store.clone(), SessionRegistry::new());
        let task = tokio::spawn(handler.run());

        agent.write_all(&HELLO).await.unwrap();
        write_frame(&mut agent, &survey("abc123")).await;
        let mut reply = [0u8; 6];
        agent.read_exact(&mut reply).await.unwrap();
        read_frame(&mut agent).await;

        let tasked = read_frame(&mut agent).await.into_envelope().unwrap();
        assert_eq!(tasked.header_str("Command-Line"), Some("sleep 1"));
        agent.write_all(&[0, 0, 0, 0]).await.unwrap();

        assert!(matches!(task.await.unwrap(), SessionOutcome::Drained { completed: 0, .. }));
        let pending = store.pending_tasks(&agent_rec).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id(), cmd.id());
    }

    #[tokio::test]
    async fn unknown_verb_in_queue_aborts_and_keeps_task() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let agent_rec = store.resolve_or_create_agent(&survey("abc123")).unwrap();
        let path = store
            .submit_task(&agent_rec, &Command::new(Execute::new("id")))
            .unwrap();
        let mut record: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        record["envelope"]["uri"] = "selfdestruct".into();
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        let (controller, mut agent) = tokio::io::duplex(4096);
        let (handler, _tx) = handler(controller, store.clone(), SessionRegistry::new());
        let task = tokio::spawn(handler.run());
        check_in(&mut agent, "abc123").await;

        match task.await.unwrap() {
            SessionOutcome::Aborted(NestError::Store(StoreError::Command(
                CommandError::UnknownCommand { verb },
            ))) => assert_eq!(verb, "selfdestruct"),
            other => panic!("unexpected outcome {other:?}"),
        }
        let mut rest = Vec::new();
        agent.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "nothing is sent after the acknowledgement");
        assert!(path.is_file());
        assert!(store.responses(&agent_rec).unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_reply_aborts_and_keeps_task() {
        let dir = TempDir::new().unwrap();
        let (store, agent_rec, cmd, mut agent, task) = tasked_session(&dir).await;

        let wire = FrameCodec::default().encode(b"uid=0(root) not json", &mut Cipher::none());
        agent.write_all(&wire).await.unwrap();

        assert!(matches!(
            task.await.unwrap(),
            SessionOutcome::Aborted(NestError::Protocol(ProtocolError::FramingError { .. }))
        ));
        assert_still_pending(&store, &agent_rec, &cmd);
    }

    #[tokio::test]
    async fn hangup_mid_frame_aborts_and_keeps_task() {
        let dir = TempDir::new().unwrap();
        let (store, agent_rec, cmd, mut agent, task) = tasked_session(&dir).await;

        agent.write_all(&[0, 0, 0, 40]).await.unwrap();
        agent.write_all(br#"{"uri":"comm"#).await.unwrap();
        drop(agent);

        assert!(matches!(
            task.await.unwrap(),
            SessionOutcome::Aborted(NestError::Protocol(ProtocolError::TruncatedFrame {
                stage: "frame body"
            }))
        ));
        assert_still_pending(&store, &agent_rec, &cmd);
    }

    #[tokio::test]
    async fn shutdown_between_tasks_interrupts() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let agent_rec = store.resolve_or_create_agent(&survey("abc123")).unwrap();
        store
            .submit_task(&agent_rec, &Command::new(Execute::new("id")))
            .unwrap();

        let (controller, mut agent) = tokio::io::duplex(4096);
        let (tx, rx) = watch::channel(true);
        let config = ControllerConfig {
            shutdown_grace_secs: 0,
            ..Default::default()
        };
        let handler = ConnectionHandler::new(
            controller,
            "test-peer",
            store.clone(),
            SessionRegistry::new(),
            Arc::new(config),
            rx,
        )
        .unwrap();
        let task = tokio::spawn(handler.run());

        agent.write_all(&HELLO).await.unwrap();
        write_frame(&mut agent, &survey("abc123")).await;

        assert!(matches!(
            task.await.unwrap(),
            SessionOutcome::Interrupted { completed: 0, .. }
        ));
        assert_eq!(store.pending_tasks(&agent_rec).unwrap().len(), 1);
        drop(tx);
    }
}
