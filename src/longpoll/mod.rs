// ABOUTME: Inbound side of the bot: long-poll session state machine and the dispatch loop
// ABOUTME: that fans decoded events out to the configured dispatcher

pub mod dispatch;
pub mod session;

pub use dispatch::EventDispatchLoop;
pub use session::{
    HttpPollTransport, LongPollError, LongPollSession, NegotiateMode, NegotiationPolicy,
    PollServer, PollServerSource, PollTransport, SessionState, MAX_BAD_RESPONSES,
};
