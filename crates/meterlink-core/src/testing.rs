//! Scripted call channel for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::channel::{CallChannel, ChannelError};
use crate::levels::{ChannelLevel, MeterLevels};
use crate::protocol::ErrorCode;
use crate::schema::LevelsSchema;
use crate::value::WireValue;

type Generator = Box<dyn Fn(u64) -> Vec<WireValue> + Send + Sync>;
type Responder = Box<dyn Fn(&[WireValue]) -> Option<Vec<WireValue>> + Send + Sync>;

/// A `[status]` reply.
pub(crate) fn status_reply(code: ErrorCode) -> Vec<WireValue> {
    vec![code.into()]
}

/// An `Ok` query reply carrying `channels` as (magnitude, peak, input peak).
pub(crate) fn levels_reply(channels: &[(f32, f32, f32)]) -> Vec<WireValue> {
    let levels: MeterLevels = channels
        .iter()
        .map(|&(magnitude, peak, input_peak)| ChannelLevel {
            magnitude,
            peak,
            input_peak,
        })
        .collect();
    LevelsSchema::encode(&levels)
}

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Result<Vec<WireValue>, String>>>,
    defaults: HashMap<String, Generator>,
    responders: HashMap<String, Responder>,
    sync_calls: HashMap<String, u64>,
    fire_and_forget: Vec<(String, Vec<WireValue>)>,
}

/// Mock [`CallChannel`].
///
/// A synchronous call is answered by, in order: the method's responder if it
/// returns a reply, the next queued reply, the method's default generator
/// (given the call index), or an empty reply.
#[derive(Default)]
pub(crate) struct ScriptedChannel {
    script: Mutex<Script>,
    delay: Mutex<Duration>,
}

impl ScriptedChannel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_reply(&self, method: &str, reply: Vec<WireValue>) {
        self.script
            .lock()
            .unwrap()
            .queued
            .entry(method.to_string())
            .or_default()
            .push_back(Ok(reply));
    }

    /// Queue a transport failure for the next call of `method`.
    pub(crate) fn push_failure(&self, method: &str, reason: &str) {
        self.script
            .lock()
            .unwrap()
            .queued
            .entry(method.to_string())
            .or_default()
            .push_back(Err(reason.to_string()));
    }

    pub(crate) fn set_default<F>(&self, method: &str, generator: F)
    where
        F: Fn(u64) -> Vec<WireValue> + Send + Sync + 'static,
    {
        self.script
            .lock()
            .unwrap()
            .defaults
            .insert(method.to_string(), Box::new(generator));
    }

    pub(crate) fn set_responder<F>(&self, method: &str, responder: F)
    where
        F: Fn(&[WireValue]) -> Option<Vec<WireValue>> + Send + Sync + 'static,
    {
        self.script
            .lock()
            .unwrap()
            .responders
            .insert(method.to_string(), Box::new(responder));
    }

    /// Block every synchronous call for `delay` before answering.
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub(crate) fn sync_calls(&self, method: &str) -> u64 {
        self.script
            .lock()
            .unwrap()
            .sync_calls
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    /// Arguments of every fire-and-forget call of `method`, oldest first.
    pub(crate) fn sent(&self, method: &str) -> Vec<Vec<WireValue>> {
        self.script
            .lock()
            .unwrap()
            .fire_and_forget
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

impl CallChannel for ScriptedChannel {
    fn call_synchronous(
        &self,
        _class: &str,
        method: &str,
        args: &[WireValue],
    ) -> Result<Vec<WireValue>, ChannelError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut script = self.script.lock().unwrap();
        let index = {
            let count = script.sync_calls.entry(method.to_string()).or_insert(0);
            *count += 1;
            *count - 1
        };

        if let Some(reply) = script.responders.get(method).and_then(|r| r(args)) {
            return Ok(reply);
        }
        if let Some(next) = script.queued.get_mut(method).and_then(|q| q.pop_front()) {
            return next.map_err(ChannelError::ConnectionLost);
        }
        Ok(script
            .defaults
            .get(method)
            .map(|generate| generate(index))
            .unwrap_or_default())
    }

    fn call(&self, _class: &str, method: &str, args: &[WireValue]) -> Result<(), ChannelError> {
        self.script
            .lock()
            .unwrap()
            .fire_and_forget
            .push((method.to_string(), args.to_vec()));
        Ok(())
    }
}
