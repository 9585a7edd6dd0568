//! Background tasks that keep the live registry current: the event
//! listener, the active prober and the stale reaper. Each talks to the
//! registry only through its methods and can be restarted on its own.

pub mod listener;
pub mod prober;
pub mod reaper;

#[cfg(test)]
pub(crate) mod fake;
