pub mod drain_loop;
pub mod recording_session;
pub mod session_state;
pub mod session_stats;

#[cfg(test)]
pub(crate) mod test_support;
