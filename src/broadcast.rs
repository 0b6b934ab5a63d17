use std::sync::Arc;

use futures::future::join_all;

use crate::error::Result;
use crate::message::{NodeId, Request, Response};
use crate::peer::Peer;

/// Outcome of one peer's call during a fan-out.
#[derive(Debug)]
pub struct Reply {
    pub peer_id: NodeId,
    pub result: Result<Response>,
}

/// Sends `request` to every peer in parallel and collects all outcomes.
///
/// Each call carries its own deadline inside [`Peer::call`], so the whole
/// fan-out is bounded by the slowest per-call cap. Nothing is cancelled
/// early; a caller that only needs the tally still waits for stragglers.
pub async fn broadcast(peers: &[Arc<Peer>], request: Request) -> Vec<Reply> {
    let calls = peers.iter().map(|peer| {
        let peer = Arc::clone(peer);
        async move {
            Reply {
                peer_id: peer.id(),
                result: peer.call(&request).await,
            }
        }
    });
    join_all(calls).await
}

/// True iff every peer answered `Vote(true)`. Errors, timeouts, and status
/// replies all count as a no vote.
pub fn all_yes(replies: &[Reply]) -> bool {
    replies
        .iter()
        .all(|reply| matches!(reply.result, Ok(Response::Vote(true))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::message::TransactionState;

    fn reply(peer_id: NodeId, result: Result<Response>) -> Reply {
        Reply { peer_id, result }
    }

    #[test]
    fn unanimous_yes_passes() {
        let replies = vec![
            reply(1, Ok(Response::Vote(true))),
            reply(2, Ok(Response::Vote(true))),
        ];
        assert!(all_yes(&replies));
    }

    #[test]
    fn any_no_vote_fails() {
        let replies = vec![
            reply(1, Ok(Response::Vote(true))),
            reply(2, Ok(Response::Vote(false))),
        ];
        assert!(!all_yes(&replies));
    }

    #[test]
    fn errors_and_odd_replies_count_as_no() {
        assert!(!all_yes(&[reply(1, Err(Error::Timeout))]));
        assert!(!all_yes(&[reply(
            1,
            Ok(Response::Status(TransactionState::Aborted))
        )]));
    }

    #[test]
    fn empty_peer_set_is_trivially_unanimous() {
        assert!(all_yes(&[]));
    }
}
