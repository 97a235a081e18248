//! Hotkey screening service: front ends register input contexts and pass key events through;
//! each context keeps its own matcher state.

use std::collections::HashMap;

use imbus_core::{
    cmd, ClientId, ClientRole, HotkeyMatcher, KeyEvent, RequestHandler, Session, Transaction, Value,
};
use tracing::{debug, info, warn};

/// Service commands, above the core range. Every reply ends with its OK or FAIL status.
pub mod command {
    use imbus_core::cmd::USER_COMMAND_BASE;

    /// `{}` → `{REPLY, UInt32(context), OK}`
    pub const REGISTER_INPUT_CONTEXT: i32 = USER_COMMAND_BASE + 1;
    /// `{UInt32(context)}` → `{REPLY, OK | FAIL}`
    pub const DEREGISTER_INPUT_CONTEXT: i32 = USER_COMMAND_BASE + 2;
    /// `{UInt32(context), KeyEvent}` → `{REPLY, String(action), OK}` or `{REPLY, FAIL}`
    pub const PROCESS_KEY_EVENT: i32 = USER_COMMAND_BASE + 3;
    /// `{}` → `{REPLY, UInt32(bindings), OK}`; Config role only.
    pub const RELOAD_HOTKEYS: i32 = USER_COMMAND_BASE + 4;
}

pub type Bindings = Vec<(String, Vec<KeyEvent>)>;

/// Produces fresh bindings for RELOAD_HOTKEYS.
pub type Reloader = Box<dyn FnMut() -> anyhow::Result<Bindings>>;

struct InputContext {
    owner: ClientId,
    matcher: HotkeyMatcher<String>,
}

pub struct HotkeyService {
    bindings: Bindings,
    contexts: HashMap<u32, InputContext>,
    next_context: u32,
    reload: Option<Reloader>,
}

fn build_matcher(bindings: &Bindings) -> HotkeyMatcher<String> {
    let mut m = HotkeyMatcher::new();
    for (action, chords) in bindings {
        m.add_many(chords, action.clone());
    }
    m
}

fn ok(reply: &mut Transaction) {
    reply.put_command(cmd::OK);
}

fn fail(reply: &mut Transaction) {
    reply.put_command(cmd::FAIL);
}

fn next_id(id: u32) -> u32 {
    id.wrapping_add(1).max(1)
}

/// Check a `{REPLY, payload.., OK | FAIL}` reply and return its status.
/// The cursor is left at the start of the payload.
pub fn reply_status(reply: &mut Transaction) -> anyhow::Result<bool> {
    let first = reply.get_command()?;
    if first != cmd::REPLY {
        anyhow::bail!("expected REPLY, got command {first}");
    }
    let mut tail = reply.clone();
    let mut last = None;
    while tail.remaining() > 0 {
        last = Some(tail.get_value()?);
    }
    match last {
        Some(Value::Command(cmd::OK)) => Ok(true),
        Some(Value::Command(cmd::FAIL)) => Ok(false),
        _ => anyhow::bail!("reply has no trailing status"),
    }
}

impl HotkeyService {
    pub fn new(bindings: Bindings) -> Self {
        Self {
            bindings,
            contexts: HashMap::new(),
            next_context: 1,
            reload: None,
        }
    }

    pub fn with_reloader(mut self, reload: Reloader) -> Self {
        self.reload = Some(reload);
        self
    }

    #[cfg(test)]
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    fn owned_context(&mut self, client: ClientId, request: &mut Transaction) -> Option<(u32, &mut InputContext)> {
        let id = request.get_uint32().ok()?;
        match self.contexts.get_mut(&id) {
            Some(ic) if ic.owner == client => Some((id, ic)),
            _ => {
                debug!(%client, context = id, "no such input context");
                None
            }
        }
    }

    fn register(&mut self, client: ClientId, reply: &mut Transaction) {
        let mut id = self.next_context;
        while self.contexts.contains_key(&id) {
            id = next_id(id);
        }
        self.next_context = next_id(id);
        self.contexts.insert(
            id,
            InputContext {
                owner: client,
                matcher: build_matcher(&self.bindings),
            },
        );
        debug!(%client, context = id, "input context registered");
        reply.put_uint32(id);
        ok(reply);
    }

    fn deregister(&mut self, client: ClientId, request: &mut Transaction, reply: &mut Transaction) {
        let found = self.owned_context(client, request).map(|(id, _)| id);
        match found {
            Some(id) => {
                self.contexts.remove(&id);
                ok(reply);
            }
            None => fail(reply),
        }
    }

    fn process_key(&mut self, client: ClientId, request: &mut Transaction, reply: &mut Transaction) {
        let Some((_, ic)) = self.owned_context(client, request) else {
            return fail(reply);
        };
        let Ok(event) = request.get_key_event() else {
            return fail(reply);
        };
        if ic.matcher.push(&event) {
            if let Some(action) = ic.matcher.match_result() {
                debug!(%client, key = %event, %action, "hotkey matched");
                reply.put_string(action);
                return ok(reply);
            }
        }
        fail(reply)
    }

    fn reload(&mut self, session: &Session, reply: &mut Transaction) {
        if session.peer_role != ClientRole::Config {
            warn!(role = %session.peer_role, "reload refused");
            return fail(reply);
        }
        let Some(reload) = self.reload.as_mut() else {
            return fail(reply);
        };
        match reload() {
            Ok(bindings) => {
                self.bindings = bindings;
                for ic in self.contexts.values_mut() {
                    ic.matcher = build_matcher(&self.bindings);
                }
                let count: usize = self.bindings.iter().map(|(_, c)| c.len()).sum();
                info!(bindings = count, "hotkeys reloaded");
                reply.put_uint32(u32::try_from(count).unwrap_or(u32::MAX));
                ok(reply);
            }
            Err(e) => {
                warn!(error = %e, "hotkey reload failed");
                fail(reply);
            }
        }
    }
}

impl RequestHandler for HotkeyService {
    fn handle_request(
        &mut self,
        client: ClientId,
        session: &Session,
        request: &mut Transaction,
        reply: &mut Transaction,
    ) {
        reply.put_command(cmd::REPLY);
        match request.get_command() {
            Ok(command::REGISTER_INPUT_CONTEXT) => self.register(client, reply),
            Ok(command::DEREGISTER_INPUT_CONTEXT) => self.deregister(client, request, reply),
            Ok(command::PROCESS_KEY_EVENT) => self.process_key(client, request, reply),
            Ok(command::RELOAD_HOTKEYS) => self.reload(session, reply),
            Ok(other) => {
                debug!(%client, command = other, "unknown command");
                fail(reply);
            }
            Err(e) => {
                debug!(%client, error = %e, "request without command");
                fail(reply);
            }
        }
    }

    fn connection_closed(&mut self, client: ClientId) {
        let before = self.contexts.len();
        self.contexts.retain(|_, ic| ic.owner != client);
        let released = before - self.contexts.len();
        if released > 0 {
            debug!(%client, released, "input contexts released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imbus_core::key::keysym;
    use imbus_core::{DataType, Dispatch, Disposition, EventMultiplexer, Events, KeyMask, SocketClient};
    use std::os::unix::io::RawFd;

    fn bindings() -> Bindings {
        vec![
            ("trigger".into(), vec!["Control+space".parse().unwrap()]),
            ("toggle".into(), vec!["Control_L+KeyRelease".parse().unwrap()]),
        ]
    }

    fn session(role: ClientRole) -> Session {
        Session {
            magic_key: 1,
            peer_role: role,
            accepted: true,
        }
    }

    struct Harness {
        service: HotkeyService,
        session: Session,
        client: ClientId,
    }

    impl Harness {
        fn send(&mut self, build: impl FnOnce(&mut Transaction)) -> Transaction {
            let mut req = Transaction::new();
            build(&mut req);
            let mut reply = Transaction::new();
            self.service
                .handle_request(self.client, &self.session, &mut req, &mut reply);
            assert_eq!(reply.get_command().unwrap(), cmd::REPLY);
            reply
        }

        fn register(&mut self) -> u32 {
            let mut r = self.send(|t| t.put_command(command::REGISTER_INPUT_CONTEXT));
            let id = r.get_uint32().unwrap();
            assert_eq!(status(&mut r), cmd::OK);
            id
        }

        fn key(&mut self, ic: u32, ev: KeyEvent) -> Option<String> {
            let mut r = self.send(|t| {
                t.put_command(command::PROCESS_KEY_EVENT);
                t.put_uint32(ic);
                t.put_key_event(&ev);
            });
            match r.peek_type().unwrap() {
                DataType::String => {
                    let action = r.get_string().unwrap();
                    assert_eq!(status(&mut r), cmd::OK);
                    Some(action)
                }
                _ => {
                    assert_eq!(status(&mut r), cmd::FAIL);
                    None
                }
            }
        }
    }

    /// Read the status and check nothing follows it.
    fn status(r: &mut Transaction) -> i32 {
        let c = r.get_command().unwrap();
        assert_eq!(r.remaining(), 0, "status must be the last item");
        c
    }

    struct Idle;

    impl SocketClient for Idle {
        fn fd(&self) -> Option<RawFd> {
            None
        }
        fn interest(&self) -> Events {
            Events::empty()
        }
        fn handle(&mut self, _: Events, _: &mut Dispatch) -> Disposition {
            Disposition::Keep
        }
    }

    /// Two distinct ids from a throwaway multiplexer.
    fn two_clients() -> (ClientId, ClientId) {
        let mut mux = EventMultiplexer::new().unwrap();
        (mux.add(Box::new(Idle)), mux.add(Box::new(Idle)))
    }

    fn harness(role: ClientRole) -> Harness {
        Harness {
            service: HotkeyService::new(bindings()),
            session: session(role),
            client: two_clients().0,
        }
    }

    #[test]
    fn press_and_release_hotkeys() {
        let mut h = harness(ClientRole::FrontEnd);
        let ic = h.register();
        assert_eq!(
            h.key(ic, KeyEvent::press(keysym::SPACE, KeyMask::CONTROL)),
            Some("trigger".into())
        );
        assert_eq!(h.key(ic, KeyEvent::press(keysym::SPACE, KeyMask::empty())), None);

        assert_eq!(h.key(ic, KeyEvent::press(keysym::CONTROL_L, KeyMask::empty())), None);
        assert_eq!(
            h.key(ic, KeyEvent::release(keysym::CONTROL_L, KeyMask::CONTROL)),
            Some("toggle".into())
        );
    }

    #[test]
    fn contexts_have_separate_state() {
        let mut h = harness(ClientRole::FrontEnd);
        let a = h.register();
        let b = h.register();
        assert_ne!(a, b);
        h.key(a, KeyEvent::press(keysym::CONTROL_L, KeyMask::empty()));
        h.key(b, KeyEvent::press(0x61, KeyMask::empty()));
        assert_eq!(
            h.key(a, KeyEvent::release(keysym::CONTROL_L, KeyMask::CONTROL)),
            Some("toggle".into())
        );
    }

    #[test]
    fn deregister_and_unknown_context() {
        let mut h = harness(ClientRole::FrontEnd);
        let ic = h.register();
        let mut r = h.send(|t| {
            t.put_command(command::DEREGISTER_INPUT_CONTEXT);
            t.put_uint32(ic);
        });
        assert_eq!(status(&mut r), cmd::OK);
        assert_eq!(h.service.context_count(), 0);
        assert_eq!(h.key(ic, KeyEvent::press(keysym::SPACE, KeyMask::CONTROL)), None);
    }

    #[test]
    fn other_clients_cannot_use_context() {
        let mut h = harness(ClientRole::FrontEnd);
        let ic = h.register();
        h.client = two_clients().1;
        assert_eq!(h.key(ic, KeyEvent::press(keysym::SPACE, KeyMask::CONTROL)), None);
    }

    #[test]
    fn close_releases_contexts() {
        let mut h = harness(ClientRole::FrontEnd);
        h.register();
        h.register();
        h.service.connection_closed(h.client);
        assert_eq!(h.service.context_count(), 0);
    }

    #[test]
    fn reload_needs_config_role() {
        let mut h = harness(ClientRole::FrontEnd);
        h.service = HotkeyService::new(bindings())
            .with_reloader(Box::new(|| -> anyhow::Result<Bindings> {
                Ok(vec![("f1".into(), vec!["F1".parse()?])])
            }));
        let mut r = h.send(|t| t.put_command(command::RELOAD_HOTKEYS));
        assert_eq!(status(&mut r), cmd::FAIL);

        h.session = session(ClientRole::Config);
        let ic = h.register();
        let mut r = h.send(|t| t.put_command(command::RELOAD_HOTKEYS));
        assert_eq!(r.get_uint32().unwrap(), 1);
        assert_eq!(status(&mut r), cmd::OK);
        assert_eq!(
            h.key(ic, KeyEvent::press(keysym::F1, KeyMask::empty())),
            Some("f1".into())
        );
        assert_eq!(h.key(ic, KeyEvent::press(keysym::SPACE, KeyMask::CONTROL)), None);
    }

    #[test]
    fn unknown_command_fails() {
        let mut h = harness(ClientRole::FrontEnd);
        let mut r = h.send(|t| t.put_command(cmd::USER_COMMAND_BASE + 99));
        assert_eq!(status(&mut r), cmd::FAIL);
    }

    #[test]
    fn wrapped_ids_skip_live_contexts() {
        let mut h = harness(ClientRole::FrontEnd);
        let first = h.register();
        assert_eq!(first, 1);
        h.service.next_context = u32::MAX;
        assert_eq!(h.register(), u32::MAX);
        assert_eq!(h.register(), 2);
        assert_eq!(h.service.context_count(), 3);
        assert!(h.key(first, KeyEvent::press(keysym::SPACE, KeyMask::CONTROL)).is_some());
    }

    #[test]
    fn status_is_read_from_the_end() {
        let mut r = Transaction::new();
        r.put_command(cmd::REPLY);
        r.put_string("trigger");
        r.put_command(cmd::OK);
        assert!(reply_status(&mut r).unwrap());
        assert_eq!(r.get_string().unwrap(), "trigger");

        let mut r = Transaction::new();
        r.put_command(cmd::REPLY);
        r.put_command(cmd::FAIL);
        assert!(!reply_status(&mut r).unwrap());

        let mut r = Transaction::new();
        r.put_command(cmd::REPLY);
        r.put_command(cmd::OK);
        r.put_uint32(3);
        assert!(reply_status(&mut r).is_err());
    }
}
