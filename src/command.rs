/*!
 * Command Dispatch
 *
 * Maps decoded request arguments onto the supported verbs and executes them
 * against the store, producing the RESP reply bytes for each.
 */

use std::mem;
use std::sync::Arc;

use crate::protocol::{resp_array, resp_bulk, resp_error, resp_integer, resp_null, resp_simple};
use crate::storage::Store;

/// Reply for an unknown verb or a known verb with too few arguments.
pub const ERR_UNKNOWN: &str = "ERR unknown command or wrong number of arguments";

/// Commands the server understands. Verb matching is ASCII case-insensitive;
/// arguments beyond the used arity are ignored, so `DEL k1 k2` acts on `k1`
/// only and `CONFIG GET ...` matches regardless of what follows.
#[derive(Debug, Clone, PartialEq)]
pub enum Cmd {
    /// SET key value
    Set(Vec<u8>, Vec<u8>),
    /// GET key
    Get(Vec<u8>),
    /// DEL key
    Del(Vec<u8>),
    /// CONFIG ... - answered with an empty array so benchmark clients that
    /// probe configuration on handshake can proceed.
    Config,
}

impl Cmd {
    /// Select a command from decoded frame arguments. `None` means the
    /// caller should reply with [`ERR_UNKNOWN`]; the connection stays open.
    pub fn from_args(mut args: Vec<Vec<u8>>) -> Option<Cmd> {
        if args.is_empty() {
            return None;
        }
        let verb = args[0].to_ascii_uppercase();
        match verb.as_slice() {
            b"SET" if args.len() >= 3 => {
                let key = mem::take(&mut args[1]);
                let value = mem::take(&mut args[2]);
                Some(Cmd::Set(key, value))
            }
            b"GET" if args.len() >= 2 => Some(Cmd::Get(mem::take(&mut args[1]))),
            b"DEL" if args.len() >= 2 => Some(Cmd::Del(mem::take(&mut args[1]))),
            b"CONFIG" => Some(Cmd::Config),
            _ => None,
        }
    }
}

/// Executes commands against a shared store.
pub struct Executor {
    store: Arc<Store>,
}

impl Executor {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Run one command and return its RESP-encoded reply.
    pub fn exec(&self, cmd: Cmd) -> Vec<u8> {
        match cmd {
            Cmd::Set(key, value) => {
                self.store.set(key, value);
                resp_simple("OK")
            }
            Cmd::Get(key) => match self.store.get(&key) {
                Some(value) => resp_bulk(&value),
                None => resp_null(),
            },
            Cmd::Del(key) => resp_integer(self.store.del(&key) as i64),
            Cmd::Config => resp_array(&[]),
        }
    }
}

/// The fixed error reply, ready to append to an outbound buffer.
pub fn unknown_command_reply() -> Vec<u8> {
    resp_error(ERR_UNKNOWN)
}
