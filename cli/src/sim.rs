// Two-user simulations over the loopback relay
//
// Every participant gets its own call engine (or chat session) with simulated
// media, exactly as two browser tabs would get theirs. All futures run on a
// single-threaded `LocalSet`, mirroring the browser event loop.

use anyhow::{Context, Result};
use futures::channel::mpsc::UnboundedReceiver;
use futures::StreamExt;
use parley_core::media::simulated::SimulatedMedia;
use parley_core::{
    CallConfig, CallEngine, CallEvent, CallStatus, ChatMessage, ChatNotification, ChatSession,
    ClientConfig, ConversationKey, LoopbackRelay,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{spawn_local, JoinHandle};
use tokio::time::Instant;

const POLL: Duration = Duration::from_millis(5);
/// Time given to background tasks to flush before a report is taken
const SETTLE: Duration = Duration::from_millis(30);

#[derive(Debug, Clone)]
pub struct CallOptions {
    pub caller: String,
    pub callee: String,
    pub accept_delay: Duration,
    pub candidates: usize,
    pub deny_permission: bool,
    /// Put the callee in another call before ours starts
    pub callee_busy: bool,
    pub hold: Duration,
    pub watchdog_tick: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            caller: "alice".to_string(),
            callee: "bob".to_string(),
            accept_delay: Duration::ZERO,
            candidates: 2,
            deny_permission: false,
            callee_busy: false,
            hold: Duration::ZERO,
            watchdog_tick: Duration::from_millis(250),
        }
    }
}

/// One UI event, stamped with who saw it and when
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub at: Duration,
    pub who: String,
    pub event: CallEvent,
}

type Transcript = Rc<RefCell<Vec<TranscriptEntry>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyOutcome {
    pub name: String,
    pub status: CallStatus,
    pub captured: usize,
    pub released: usize,
}

#[derive(Debug, Clone)]
pub struct CallReport {
    pub transcript: Vec<TranscriptEntry>,
    pub outcomes: Vec<PartyOutcome>,
}

impl CallReport {
    pub fn outcome(&self, name: &str) -> Option<&PartyOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    pub fn events_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a CallEvent> + 'a {
        self.transcript
            .iter()
            .filter(move |entry| entry.who == name)
            .map(|entry| &entry.event)
    }

    pub fn reached(&self, name: &str, status: CallStatus) -> bool {
        self.events_of(name)
            .any(|e| matches!(e, CallEvent::StateChanged { status: s, .. } if *s == status))
    }
}

struct Participant {
    name: String,
    engine: CallEngine,
    media: SimulatedMedia,
}

impl Participant {
    fn join(
        relay: &LoopbackRelay,
        name: &str,
        media: SimulatedMedia,
        config: &CallConfig,
        transcript: &Transcript,
        origin: Instant,
        background: &mut Vec<JoinHandle<()>>,
    ) -> Self {
        let inbox = relay.register(name);
        let engine = CallEngine::new(
            Arc::new(relay.transport(name)),
            Arc::new(media.clone()),
            config.clone(),
        );

        let mut events = engine.subscribe();
        let transcript = Rc::clone(transcript);
        let who = name.to_string();
        background.push(spawn_local(async move {
            while let Some(event) = events.next().await {
                transcript.borrow_mut().push(TranscriptEntry {
                    at: origin.elapsed(),
                    who: who.clone(),
                    event,
                });
            }
        }));

        let runner = engine.clone();
        let signals = inbox.signals;
        background.push(spawn_local(async move {
            runner.run(signals).await;
        }));

        Self {
            name: name.to_string(),
            engine,
            media,
        }
    }

    /// Answer every incoming call after `delay`
    fn auto_answer(&self, delay: Duration) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let name = self.name.clone();
        let mut events = engine.subscribe();
        spawn_local(async move {
            while let Some(event) = events.next().await {
                if let CallEvent::IncomingCall { from } = event {
                    tokio::time::sleep(delay).await;
                    if let Err(err) = engine.accept_call(&name, &from).await {
                        tracing::warn!("{} could not answer {}: {}", name, from, err);
                    }
                }
            }
        })
    }

    fn outcome(&self) -> PartyOutcome {
        PartyOutcome {
            name: self.name.clone(),
            status: self.engine.status(),
            captured: self.media.acquired_count(),
            released: self.media.total_releases(),
        }
    }
}

async fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while !done() {
        if start.elapsed() >= limit {
            return false;
        }
        tokio::time::sleep(POLL).await;
    }
    true
}

/// Ring `callee`, let them answer, hold the call, then hang up.
///
/// Must run inside a `LocalSet`.
pub async fn simulate_call(config: &ClientConfig, options: &CallOptions) -> Result<CallReport> {
    anyhow::ensure!(
        options.caller != options.callee,
        "caller and callee must be different users"
    );

    let relay = LoopbackRelay::new();
    let transcript: Transcript = Rc::new(RefCell::new(Vec::new()));
    let origin = Instant::now();
    let mut background = Vec::new();

    let media = |name: &str| SimulatedMedia::new(name).with_local_candidates(options.candidates);
    let callee_media = if options.deny_permission {
        media(&options.callee).deny_permission()
    } else {
        media(&options.callee)
    };

    let caller = Participant::join(
        &relay,
        &options.caller,
        media(&options.caller),
        &config.call,
        &transcript,
        origin,
        &mut background,
    );
    let callee = Participant::join(
        &relay,
        &options.callee,
        callee_media,
        &config.call,
        &transcript,
        origin,
        &mut background,
    );
    background.push(callee.auto_answer(options.accept_delay));

    let intruder = options.callee_busy.then(|| {
        let name = format!("{}-friend", options.callee);
        Participant::join(
            &relay,
            &name,
            media(&name),
            &config.call,
            &transcript,
            origin,
            &mut background,
        )
    });
    if let Some(intruder) = &intruder {
        intruder
            .engine
            .initiate_call(&intruder.name, &callee.name)
            .await
            .context("busy-line call failed")?;
        let limit = options.accept_delay + Duration::from_secs(2);
        wait_until(limit, || callee.engine.status() == CallStatus::Active).await;
    }
    let parties: Vec<&Participant> = [Some(&caller), Some(&callee), intruder.as_ref()]
        .into_iter()
        .flatten()
        .collect();

    let engines: Vec<CallEngine> = parties.iter().map(|p| p.engine.clone()).collect();
    let tick = options.watchdog_tick;
    background.push(spawn_local(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            for engine in &engines {
                engine.check_timeouts().await;
            }
        }
    }));

    match caller.engine.initiate_call(&caller.name, &callee.name).await {
        Ok(_) => {
            let limit = options.accept_delay + Duration::from_secs(2);
            let connected = wait_until(limit, || {
                caller.engine.status() == CallStatus::Active || !caller.engine.is_in_call()
            })
            .await;
            if !connected {
                tracing::info!("{} still {} after {:?}", caller.name, caller.engine.status(), limit);
            }
            if caller.engine.is_in_call() {
                tokio::time::sleep(options.hold).await;
                caller.engine.hang_up().await?;
            }
        }
        Err(err) => tracing::warn!("{} could not call {}: {}", caller.name, callee.name, err),
    }

    for party in parties.iter().skip(2) {
        party.engine.hang_up().await?;
    }
    let all_done = || parties.iter().all(|p| !p.engine.is_in_call());
    wait_until(Duration::from_secs(1), all_done).await;
    tokio::time::sleep(SETTLE).await;

    let outcomes = parties.iter().map(|p| p.outcome()).collect();
    for task in background {
        task.abort();
    }

    let mut transcript = transcript.borrow().clone();
    transcript.sort_by_key(|entry| entry.at);
    Ok(CallReport {
        transcript,
        outcomes,
    })
}

/// A user's view after the chat simulation
#[derive(Debug, Clone)]
pub struct ChatView {
    pub name: String,
    pub online: Vec<String>,
    pub groups: Vec<String>,
    pub conversations: Vec<(ConversationKey, Vec<ChatMessage>)>,
}

struct ChatUser {
    name: String,
    session: ChatSession,
    inbox: UnboundedReceiver<ChatNotification>,
}

impl ChatUser {
    async fn login(relay: &LoopbackRelay, name: &str, config: &ClientConfig) -> Result<Self> {
        let inbox = relay.register(name).chat;
        let session = ChatSession::new(Arc::new(relay.chat_service()), config.chat.clone());
        session.login(name).await?;
        Ok(Self {
            name: name.to_string(),
            session,
            inbox,
        })
    }

    /// Apply every notification pushed so far
    fn sync(&mut self) {
        while let Ok(Some(notification)) = self.inbox.try_next() {
            self.session.handle_notification(notification);
        }
    }

    fn view(&self, keys: &[ConversationKey]) -> ChatView {
        ChatView {
            name: self.name.clone(),
            online: self.session.online_users(),
            groups: self.session.groups(),
            conversations: keys
                .iter()
                .map(|key| (key.clone(), self.session.history(key)))
                .collect(),
        }
    }
}

/// Direct messages, a group, and a voice note between two users
pub async fn simulate_chat(
    config: &ClientConfig,
    first: &str,
    second: &str,
    group: &str,
    voice_bytes: usize,
) -> Result<Vec<ChatView>> {
    anyhow::ensure!(first != second, "the two users must be different");

    let relay = LoopbackRelay::new();
    let mut a = ChatUser::login(&relay, first, config).await?;
    let mut b = ChatUser::login(&relay, second, config).await?;
    a.sync();
    b.sync();

    a.session.select(ConversationKey::Direct(b.name.clone()));
    a.session.send_text("free for a call later?").await?;
    b.sync();
    b.session.select(ConversationKey::Direct(a.name.clone()));
    b.session.send_text("sure, ring me any time").await?;
    a.sync();

    a.session.create_group(group).await?;
    a.session.add_to_group(group, &b.name).await?;
    b.sync();

    let group_key = ConversationKey::Group(group.to_string());
    a.session.select(group_key.clone());
    a.session.send_text("standup in five").await?;
    b.sync();
    b.session.select(group_key.clone());
    b.session.send_voice_note(vec![0u8; voice_bytes]).await?;
    a.sync();

    let views = vec![
        a.view(&[ConversationKey::Direct(b.name.clone()), group_key.clone()]),
        b.view(&[ConversationKey::Direct(a.name.clone()), group_key]),
    ];
    Ok(views)
}
