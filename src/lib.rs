/*
    Round-based BFT consensus in the Tendermint style. Validators agree on
    one block per height by running rounds of propose, prevote and
    precommit. A prevote quorum (more than 2/3 of voting power) for a block
    is a polka; a validator precommits only a block it saw a polka for and
    locks on it, and a later round can only move the lock with a newer
    polka. A precommit quorum for one block commits it.

    Every event that reaches the state machine is written to a write-ahead
    log first, so a crashed validator rebuilds its round state by replaying
    the log, after a handshake has brought the application up to the last
    stored block.
*/

pub mod app;
pub mod common;
pub mod config;
pub mod consensus;
pub mod evidence;
pub mod mempool;
pub mod network;
pub mod signer;
pub mod state;
pub mod storage;
pub mod types;
