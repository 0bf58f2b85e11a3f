//! The stream behind an epoll descriptor.
//!
//! Registrations are keyed by target stream identity, not by descriptor, so
//! dup'd descriptors share one registration — the open-file-description
//! semantics of the real epoll. Targets are held weakly; a target whose last
//! descriptor closed silently leaves the interest set.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Errno, VfsError, VfsResult};
use crate::flags::OpenFlags;
use crate::poll::{EpollEvent, EpollEvents, EpollOp};
use crate::stream::{stream_key, Stream, StreamCore};

struct Registration {
    target: Weak<dyn Stream>,
    events: EpollEvents,
    data: u64,
}

pub struct EpollStream {
    core: StreamCore,
    interest: Mutex<HashMap<usize, Registration>>,
}

impl EpollStream {
    pub fn new(oflag: OpenFlags) -> Arc<EpollStream> {
        Arc::new(EpollStream {
            core: StreamCore::new(String::new(), oflag),
            interest: Mutex::new(HashMap::new()),
        })
    }

    pub fn ctl(
        &self,
        op: EpollOp,
        target: &Arc<dyn Stream>,
        event: Option<EpollEvent>,
    ) -> VfsResult<()> {
        let key = stream_key(target);
        let mut interest = self.interest.lock();
        match op {
            EpollOp::Add => {
                let event = event.ok_or(VfsError::new(Errno::FAULT, "epoll.ctl"))?;
                if interest.contains_key(&key) {
                    return Err(VfsError::new(Errno::EXIST, "epoll.ctl_add"));
                }
                interest.insert(
                    key,
                    Registration {
                        target: Arc::downgrade(target),
                        events: event.events,
                        data: event.data,
                    },
                );
                Ok(())
            }
            EpollOp::Mod => {
                let event = event.ok_or(VfsError::new(Errno::FAULT, "epoll.ctl"))?;
                let registration = interest
                    .get_mut(&key)
                    .ok_or(VfsError::new(Errno::NOENT, "epoll.ctl_mod"))?;
                registration.events = event.events;
                registration.data = event.data;
                Ok(())
            }
            EpollOp::Del => {
                interest
                    .remove(&key)
                    .ok_or(VfsError::new(Errno::NOENT, "epoll.ctl_del"))?;
                Ok(())
            }
        }
    }

    /// Readiness pass: fill `out` with ready registrations, pruning dead
    /// targets along the way.
    pub fn collect_ready(&self, out: &mut [EpollEvent]) -> usize {
        let mut interest = self.interest.lock();
        interest.retain(|_, registration| registration.target.upgrade().is_some());
        let mut count = 0;
        for registration in interest.values() {
            if count >= out.len() {
                break;
            }
            let Some(target) = registration.target.upgrade() else {
                continue;
            };
            let ready = EpollEvents::from_poll_events(target.poll_events());
            // Error and hangup are always reported, as with poll.
            let mask = registration.events | EpollEvents::ERR | EpollEvents::HUP;
            let events = ready & mask;
            if !events.is_empty() {
                out[count] = EpollEvent {
                    events,
                    data: registration.data,
                };
                count += 1;
            }
        }
        count
    }

    pub fn has_ready(&self) -> bool {
        let interest = self.interest.lock();
        for registration in interest.values() {
            let Some(target) = registration.target.upgrade() else {
                continue;
            };
            let ready = EpollEvents::from_poll_events(target.poll_events());
            let mask = registration.events | EpollEvents::ERR | EpollEvents::HUP;
            if !(ready & mask).is_empty() {
                return true;
            }
        }
        false
    }

    pub fn interest_len(&self) -> usize {
        self.interest.lock().len()
    }
}

impl Stream for EpollStream {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn stream_type(&self) -> &'static str {
        "epoll"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_select_read_ready(&self) -> bool {
        self.has_ready()
    }

    fn is_select_write_ready(&self) -> bool {
        false
    }
}
