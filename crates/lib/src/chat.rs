//! One chat exchange: validate, extend the transcript, stream the model's reply, finalize.
//!
//! The session lock is held from the user-turn append until the exchange ends, so concurrent
//! requests are served one after another and each user turn is directly followed by its reply.
//! Fragments go out over an unbounded channel as soon as the model produces them. Failures become
//! one final [`ChatEvent::Error`]; the transcript then keeps the user turn but gets no model turn.

use crate::llm::{ChatBackend, LlmError};
use crate::session::{ContentPart, SharedSession};
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Body of `POST /chat`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub question: Option<String>,
    /// Base64 PNG, optionally as a `data:image/png;base64,` URL.
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("question must not be empty")]
    EmptyQuestion,
    #[error("image is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error(transparent)]
    Remote(#[from] LlmError),
    #[error("model did not finish within {0:?}")]
    Timeout(Duration),
}

/// A request that passed input validation; only these reach the session.
#[derive(Debug, Clone)]
pub struct ValidatedChat {
    question: String,
    image: Option<String>,
}

impl ChatRequest {
    /// Reject an absent or blank question. No state is touched here.
    pub fn validate(self) -> Result<ValidatedChat, ChatError> {
        let question = self
            .question
            .filter(|q| !q.trim().is_empty())
            .ok_or(ChatError::EmptyQuestion)?;
        let image = self.image.filter(|i| !i.trim().is_empty());
        Ok(ValidatedChat { question, image })
    }
}

impl ValidatedChat {
    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }
}

/// What the client sees, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Fragment(String),
    /// Terminal; nothing follows.
    Error(String),
}

/// How an exchange ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    /// Reply appended to the transcript.
    Completed { reply: String },
    /// Error event sent; no model turn appended.
    Failed(String),
    /// Receiver dropped before completion; no model turn appended.
    ClientGone,
}

/// Decode the transport encoding of an attached image.
fn decode_image(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let encoded = encoded.trim();
    let payload = match encoded.strip_prefix("data:") {
        Some(url) => url.split_once(',').map(|(_, data)| data).unwrap_or(url),
        None => encoded,
    };
    base64::engine::general_purpose::STANDARD.decode(payload)
}

/// Runs chat exchanges against the shared session.
#[derive(Clone)]
pub struct ChatService {
    session: SharedSession,
    backend: Arc<dyn ChatBackend>,
    stream_timeout: Duration,
}

impl ChatService {
    pub fn new(session: SharedSession, backend: Arc<dyn ChatBackend>, stream_timeout: Duration) -> Self {
        Self {
            session,
            backend,
            stream_timeout,
        }
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    pub fn backend(&self) -> &dyn ChatBackend {
        self.backend.as_ref()
    }

    /// Spawn the exchange; events arrive on the returned receiver. Dropping the receiver cancels
    /// the remote call.
    pub fn start(
        &self,
        chat: ValidatedChat,
    ) -> (mpsc::UnboundedReceiver<ChatEvent>, JoinHandle<ChatOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = self.clone();
        let handle = tokio::spawn(async move { service.run(chat, tx).await });
        (rx, handle)
    }

    /// Run one exchange to the end, sending events to `tx`.
    pub async fn run(&self, chat: ValidatedChat, tx: mpsc::UnboundedSender<ChatEvent>) -> ChatOutcome {
        log::info!(
            "chat request received (image: {})",
            if chat.has_image() { "yes" } else { "no" }
        );
        let mut session = self.session.lock().await;

        let mut parts = vec![ContentPart::text(chat.question)];
        if let Some(encoded) = chat.image {
            match decode_image(&encoded) {
                Ok(bytes) => {
                    log::info!("decoded attached image ({} bytes)", bytes.len());
                    parts.push(ContentPart::png(bytes));
                }
                Err(e) => return fail(&tx, e.into()),
            }
        }
        session.append_user_turn(parts);

        log::info!(
            "sending streaming request to {} ({} turns)",
            self.backend.model(),
            session.len()
        );
        let mut on_chunk = |fragment: &str| {
            let _ = tx.send(ChatEvent::Fragment(fragment.to_string()));
        };
        let call = tokio::time::timeout(
            self.stream_timeout,
            self.backend.chat_stream(session.turns(), &mut on_chunk),
        );
        let result = tokio::select! {
            r = call => r,
            _ = tx.closed() => {
                log::info!("chat client disconnected; remote call cancelled");
                return ChatOutcome::ClientGone;
            }
        };

        match result {
            Err(_elapsed) => fail(&tx, ChatError::Timeout(self.stream_timeout)),
            Ok(Err(e)) => fail(&tx, e.into()),
            Ok(Ok(_)) if tx.is_closed() => {
                log::info!("chat client disconnected before the reply was delivered");
                ChatOutcome::ClientGone
            }
            Ok(Ok(reply)) => {
                session.append_model_turn(reply.clone());
                log::info!("streaming response finished ({} chars)", reply.chars().count());
                ChatOutcome::Completed { reply }
            }
        }
    }
}

fn fail(tx: &mpsc::UnboundedSender<ChatEvent>, err: ChatError) -> ChatOutcome {
    log::error!("chat stream failed: {}", err);
    let message = err.to_string();
    let _ = tx.send(ChatEvent::Error(message.clone()));
    ChatOutcome::Failed(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConversationSession, ConversationTurn, Role};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replies with fixed fragments, optionally failing after `fail_after` of them.
    struct Scripted {
        fragments: Vec<&'static str>,
        fail_after: Option<usize>,
        delay: Duration,
        calls: AtomicUsize,
        turns_seen: std::sync::Mutex<Vec<usize>>,
    }

    impl Scripted {
        fn new(fragments: Vec<&'static str>) -> Self {
            Self {
                fragments,
                fail_after: None,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                turns_seen: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for Scripted {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn chat_stream(
            &self,
            turns: &[ConversationTurn],
            on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.turns_seen.lock().unwrap().push(turns.len());
            let mut out = String::new();
            for (i, f) in self.fragments.iter().copied().enumerate() {
                if self.fail_after == Some(i) {
                    return Err(LlmError::Api("connection reset".to_string()));
                }
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                on_chunk(f);
                out.push_str(f);
            }
            Ok(out)
        }
    }

    /// Echoes the latest user question back in two fragments, slowly.
    struct Echo;

    #[async_trait]
    impl ChatBackend for Echo {
        fn model(&self) -> &str {
            "echo"
        }

        async fn chat_stream(
            &self,
            turns: &[ConversationTurn],
            on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> Result<String, LlmError> {
            let question = turns.last().map(|t| t.text()).unwrap_or_default();
            tokio::time::sleep(Duration::from_millis(20)).await;
            on_chunk("re: ");
            tokio::time::sleep(Duration::from_millis(20)).await;
            on_chunk(&question);
            Ok(format!("re: {}", question))
        }
    }

    /// Never answers.
    struct Hang;

    #[async_trait]
    impl ChatBackend for Hang {
        fn model(&self) -> &str {
            "hang"
        }

        async fn chat_stream(
            &self,
            _turns: &[ConversationTurn],
            _on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> Result<String, LlmError> {
            std::future::pending().await
        }
    }

    fn service(backend: Arc<dyn ChatBackend>) -> ChatService {
        ChatService::new(
            ConversationSession::initialize("You are an assistant.").into_shared(),
            backend,
            Duration::from_secs(5),
        )
    }

    fn ask(question: &str) -> ValidatedChat {
        ChatRequest {
            question: Some(question.to_string()),
            image: None,
        }
        .validate()
        .unwrap()
    }

    async fn run_collect(svc: &ChatService, chat: ValidatedChat) -> (ChatOutcome, Vec<ChatEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = svc.run(chat, tx).await;
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        (outcome, events)
    }

    #[test]
    fn blank_or_missing_question_is_rejected() {
        for question in [None, Some(""), Some("   ")] {
            let req = ChatRequest {
                question: question.map(String::from),
                image: Some("aGk=".to_string()),
            };
            assert!(matches!(req.validate(), Err(ChatError::EmptyQuestion)));
        }
        let ok = ChatRequest {
            question: Some("Hi".to_string()),
            image: Some(String::new()),
        }
        .validate()
        .unwrap();
        assert!(!ok.has_image());
    }

    #[test]
    fn decode_accepts_data_urls() {
        assert_eq!(decode_image("aGk=").unwrap(), b"hi".to_vec());
        assert_eq!(decode_image(" data:image/png;base64,aGk= ").unwrap(), b"hi".to_vec());
        assert!(decode_image("!!!").is_err());
    }

    #[tokio::test]
    async fn fragments_stream_in_order_and_reply_is_appended() {
        let backend = Arc::new(Scripted::new(vec!["Hel", "lo!"]));
        let svc = service(backend.clone());
        let (outcome, events) = run_collect(&svc, ask("Hi")).await;

        assert_eq!(
            events,
            vec![
                ChatEvent::Fragment("Hel".to_string()),
                ChatEvent::Fragment("lo!".to_string())
            ]
        );
        assert_eq!(outcome, ChatOutcome::Completed { reply: "Hello!".to_string() });
        // The model saw the seed pair plus the new user turn.
        assert_eq!(*backend.turns_seen.lock().unwrap(), vec![3]);

        let session = svc.session().lock().await;
        assert_eq!(session.len(), 4);
        assert_eq!(session.turns()[2].text(), "Hi");
        assert_eq!(session.last().unwrap().role, Role::Model);
        assert_eq!(session.last().unwrap().text(), "Hello!");
    }

    #[tokio::test]
    async fn malformed_image_emits_one_error_and_leaves_transcript() {
        let backend = Arc::new(Scripted::new(vec!["never"]));
        let svc = service(backend.clone());
        let chat = ChatRequest {
            question: Some("what is this?".to_string()),
            image: Some("%%% not base64 %%%".to_string()),
        }
        .validate()
        .unwrap();
        let (outcome, events) = run_collect(&svc, chat).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ChatEvent::Error(m) if m.contains("base64")));
        assert!(matches!(outcome, ChatOutcome::Failed(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(svc.session().lock().await.len(), 2);
    }

    #[tokio::test]
    async fn valid_image_is_attached_to_user_turn() {
        let svc = service(Arc::new(Scripted::new(vec!["a harbor"])));
        let chat = ChatRequest {
            question: Some("what is this?".to_string()),
            image: Some("iVBORw==".to_string()),
        }
        .validate()
        .unwrap();
        let (outcome, _) = run_collect(&svc, chat).await;
        assert!(matches!(outcome, ChatOutcome::Completed { .. }));

        let session = svc.session().lock().await;
        let user = &session.turns()[2];
        assert!(user.has_image());
        assert_eq!(user.parts[1], ContentPart::png(vec![0x89, b'P', b'N', b'G']));
    }

    #[tokio::test]
    async fn remote_failure_mid_stream_keeps_fragment_and_skips_model_turn() {
        let mut scripted = Scripted::new(vec!["Hel", "lo!"]);
        scripted.fail_after = Some(1);
        let svc = service(Arc::new(scripted));
        let (outcome, events) = run_collect(&svc, ask("Hi")).await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ChatEvent::Fragment("Hel".to_string()));
        assert!(matches!(&events[1], ChatEvent::Error(m) if m.contains("connection reset")));
        assert!(matches!(outcome, ChatOutcome::Failed(_)));

        let session = svc.session().lock().await;
        assert_eq!(session.len(), 3);
        assert_eq!(session.last().unwrap().role, Role::User);
    }

    #[tokio::test]
    async fn next_request_continues_after_a_failed_turn() {
        let mut scripted = Scripted::new(vec!["x"]);
        scripted.fail_after = Some(0);
        let svc = service(Arc::new(scripted));
        run_collect(&svc, ask("first")).await;

        let svc = ChatService::new(
            svc.session().clone(),
            Arc::new(Scripted::new(vec!["ok"])),
            Duration::from_secs(5),
        );
        run_collect(&svc, ask("second")).await;

        let session = svc.session().lock().await;
        let texts: Vec<String> = session.turns()[2..].iter().map(|t| t.text()).collect();
        assert_eq!(texts, vec!["first", "second", "ok"]);
    }

    #[tokio::test]
    async fn concurrent_requests_do_not_interleave() {
        let svc = service(Arc::new(Echo));
        let (rx_a, a) = svc.start(ask("alpha"));
        let (rx_b, b) = svc.start(ask("beta"));
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        drop((rx_a, rx_b));
        assert!(matches!(a, ChatOutcome::Completed { .. }));
        assert!(matches!(b, ChatOutcome::Completed { .. }));

        let session = svc.session().lock().await;
        assert_eq!(session.len(), 6);
        for pair in session.turns()[2..].chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Model);
            assert_eq!(pair[1].text(), format!("re: {}", pair[0].text()));
        }
    }

    #[tokio::test]
    async fn client_disconnect_cancels_without_model_turn() {
        let mut scripted = Scripted::new(vec!["one", "two", "three"]);
        scripted.delay = Duration::from_millis(50);
        let svc = service(Arc::new(scripted));
        let (mut rx, handle) = svc.start(ask("Hi"));

        assert_eq!(rx.recv().await, Some(ChatEvent::Fragment("one".to_string())));
        drop(rx);

        assert_eq!(handle.await.unwrap(), ChatOutcome::ClientGone);
        let session = svc.session().lock().await;
        assert_eq!(session.len(), 3);
        assert_eq!(session.last().unwrap().role, Role::User);
    }

    #[tokio::test]
    async fn hung_model_times_out_with_error_event() {
        let svc = ChatService::new(
            ConversationSession::initialize("p").into_shared(),
            Arc::new(Hang),
            Duration::from_millis(50),
        );
        let (outcome, events) = run_collect(&svc, ask("Hi")).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ChatEvent::Error(m) if m.contains("did not finish")));
        assert!(matches!(outcome, ChatOutcome::Failed(_)));
        assert_eq!(svc.session().lock().await.len(), 3);
    }
}
