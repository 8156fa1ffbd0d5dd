//! Integration suite: several coordinators wired through an in-process
//! gossip hub, exercising keygen/sign flows, admission rules, dispatch races
//! and timeouts end to end.

mod dispatch;
