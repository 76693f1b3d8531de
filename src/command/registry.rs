//! Verb-to-constructor registry.
//!
//! Populated explicitly by [`CommandRegistry::with_builtins`]; further verbs
//! can be added with [`CommandRegistry::register`] or
//! [`CommandRegistry::register_type`].

use std::collections::HashMap;

use super::{
    Command, CommandAction, DecodeCommand, Download, Execute, FileList, Handshake, Proxy,
};
use crate::error::{CommandError, CommandResult};
use crate::protocol::Envelope;

/// Builds a command action from its envelope and optional streamed payload.
pub type CommandConstructor =
    fn(&Envelope, Option<Vec<u8>>) -> CommandResult<Box<dyn CommandAction>>;

/// Maps wire verbs to command constructors.
pub struct CommandRegistry {
    constructors: HashMap<String, CommandConstructor>,
}

fn construct<T: DecodeCommand>(
    envelope: &Envelope,
    payload: Option<Vec<u8>>,
) -> CommandResult<Box<dyn CommandAction>> {
    Ok(Box::new(T::from_envelope(envelope, payload)?))
}

impl CommandRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with the five built-in verbs.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_type::<Handshake>();
        registry.register_type::<Download>();
        registry.register_type::<FileList>();
        registry.register_type::<Execute>();
        registry.register_type::<Proxy>();
        registry
    }

    /// Register a constructor. An existing entry for `verb` is replaced.
    pub fn register(&mut self, verb: impl Into<String>, constructor: CommandConstructor) {
        self.constructors.insert(verb.into(), constructor);
    }

    /// Register a [`DecodeCommand`] type under its own verb.
    pub fn register_type<T: DecodeCommand>(&mut self) {
        self.register(T::VERB, construct::<T>);
    }

    pub fn contains(&self, verb: &str) -> bool {
        self.constructors.contains_key(verb)
    }

    /// Registered verbs, sorted.
    pub fn verbs(&self) -> Vec<&str> {
        let mut verbs: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        verbs.sort_unstable();
        verbs
    }

    /// Build the action for `envelope.uri`.
    pub fn decode(
        &self,
        envelope: &Envelope,
        payload: Option<Vec<u8>>,
    ) -> CommandResult<Box<dyn CommandAction>> {
        let constructor =
            self.constructors
                .get(&envelope.uri)
                .ok_or_else(|| CommandError::UnknownCommand {
                    verb: envelope.uri.clone(),
                })?;
        constructor(envelope, payload)
    }

    /// Build a fresh [`Command`] for `envelope`, owned by `agent_id` if given.
    pub fn dispatch(
        &self,
        envelope: &Envelope,
        payload: Option<Vec<u8>>,
        agent_id: Option<&str>,
    ) -> CommandResult<Command> {
        let command = Command::from_boxed(self.decode(envelope, payload)?);
        Ok(match agent_id {
            Some(id) => command.for_agent(id),
            None => command,
        })
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("verbs", &self.verbs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ResponseContext, ResponseOutcome, Response};
    use serde_json::{Map, Value};

    #[derive(Debug)]
    struct Upload {
        bytes: Vec<u8>,
    }

    impl CommandAction for Upload {
        fn verb(&self) -> &'static str {
            "upload"
        }
        fn headers(&self) -> Map<String, Value> {
            let mut headers = Map::new();
            headers.insert("Transfer-Encoding".into(), "chunked".into());
            headers
        }
        fn streamed_payload(&self) -> Option<&[u8]> {
            Some(&self.bytes)
        }
        fn handle_response(
            &self,
            _ctx: &ResponseContext<'_>,
            _response: &Response,
        ) -> CommandResult<ResponseOutcome> {
            Ok(ResponseOutcome::Acknowledged)
        }
    }

    fn upload(_env: &Envelope, payload: Option<Vec<u8>>) -> CommandResult<Box<dyn CommandAction>> {
        Ok(Box::new(Upload {
            bytes: payload.unwrap_or_default(),
        }))
    }

    #[test]
    fn builtins_cover_all_verbs() {
        let registry = CommandRegistry::with_builtins();
        assert_eq!(
            registry.verbs(),
            vec!["command", "download", "filelist", "handshake", "proxy"]
        );
    }

    #[test]
    fn unknown_verb_is_an_error() {
        let registry = CommandRegistry::with_builtins();
        let err = registry
            .dispatch(&Envelope::new("upload"), None, Some("abc"))
            .unwrap_err();
        assert!(matches!(err, CommandError::UnknownCommand { verb } if verb == "upload"));
    }

    #[test]
    fn dispatch_builds_owned_command() {
        let registry = CommandRegistry::with_builtins();
        let env = Envelope::new("command").with_header("Command-Line", "whoami");
        let cmd = registry.dispatch(&env, None, Some("abc123")).unwrap();
        assert_eq!(cmd.verb(), "command");
        assert_eq!(cmd.agent_id(), Some("abc123"));
        assert_eq!(cmd.envelope(), env);
    }

    #[test]
    fn registered_verb_carries_streamed_payload() {
        let mut registry = CommandRegistry::new();
        registry.register("upload", upload);
        assert!(registry.contains("upload"));

        let cmd = registry
            .dispatch(&Envelope::new("upload"), Some(b"blob".to_vec()), None)
            .unwrap();
        assert_eq!(cmd.streamed_payload(), Some(&b"blob"[..]));
        assert!(cmd.envelope().is_chunked());
    }
}
