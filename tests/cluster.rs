//! Live-cluster scenarios: real TCP listeners, per-test port ranges, and a
//! throwaway log directory per cluster.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::net::TcpListener;
use uuid::Uuid;

use two_phase_register::message::{Request, RequestArgs, Response, TransactionState};
use two_phase_register::node::{Node, NodeConfig};
use two_phase_register::peer::Peer;
use two_phase_register::Error;

fn membership(ids: &[u32], base_port: u16) -> HashMap<u32, String> {
    ids.iter()
        .map(|&id| (id, format!("127.0.0.1:{}", base_port + id as u16)))
        .collect()
}

/// Starts one node per id, all sharing a membership map and log directory.
async fn start_cluster(ids: &[u32], base_port: u16, log_dir: &Path) -> Result<Vec<Node>> {
    let membership = membership(ids, base_port);
    let mut nodes = Vec::with_capacity(ids.len());
    for &id in ids {
        nodes.push(
            Node::start(NodeConfig {
                id,
                membership: membership.clone(),
                log_dir: log_dir.to_path_buf(),
            })
            .await?,
        );
    }
    Ok(nodes)
}

async fn shutdown(nodes: &[Node]) {
    for node in nodes {
        node.close().await;
    }
}

#[tokio::test]
async fn happy_path_commits_on_every_node() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let nodes = start_cluster(&[0, 1, 2], 18110, dir.path()).await?;

    nodes[0].transaction(10).await?;

    for node in &nodes {
        assert_eq!(node.state(), 10, "node {} diverged", node.id());
    }

    shutdown(&nodes).await;
    Ok(())
}

#[tokio::test]
async fn busy_participant_aborts_the_transaction() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let nodes = start_cluster(&[0, 1], 18210, dir.path()).await?;

    // Park a foreign prepare on the participant so the coordinator's
    // prepare phase cannot win the lock.
    let squatter = Peer::new(1, "127.0.0.1:18211");
    let vote = squatter
        .call(&Request::Prepare(RequestArgs {
            tx_id: Uuid::new_v4(),
            value: 999,
            sender_id: 1,
        }))
        .await?;
    assert_eq!(vote, Response::Vote(true));

    let err = nodes[0].transaction(50).await.unwrap_err();
    assert!(matches!(err, Error::ConsensusFailed), "got {err}");

    assert_eq!(nodes[0].state(), 0, "coordinator state changed on abort");
    assert_eq!(nodes[1].state(), 0, "participant state changed on abort");

    shutdown(&nodes).await;
    Ok(())
}

#[tokio::test]
async fn dead_peer_fails_the_transaction_quickly() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let nodes = start_cluster(&[0, 1], 18310, dir.path()).await?;

    nodes[1].close().await;

    let started = Instant::now();
    let err = nodes[0].transaction(10).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::ConsensusFailed), "got {err}");
    assert!(
        elapsed < Duration::from_secs(6),
        "failure took {elapsed:?}, expected under the call deadline"
    );
    assert_eq!(nodes[0].state(), 0);

    nodes[0].close().await;
    Ok(())
}

#[tokio::test]
async fn sequential_transactions_accumulate() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let nodes = start_cluster(&[0, 1, 2], 18410, dir.path()).await?;

    for _ in 0..5 {
        nodes[0].transaction(1).await?;
    }

    for node in &nodes {
        assert_eq!(node.state(), 5, "node {} diverged", node.id());
    }

    shutdown(&nodes).await;
    Ok(())
}

#[tokio::test]
async fn unknown_transaction_reads_as_aborted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let nodes = start_cluster(&[0], 18510, dir.path()).await?;

    let client = Peer::new(0, "127.0.0.1:18510");
    let response = client
        .call(&Request::GetStatus {
            tx_id: Uuid::new_v4(),
        })
        .await?;

    assert_eq!(response, Response::Status(TransactionState::Aborted));

    shutdown(&nodes).await;
    Ok(())
}

#[tokio::test]
async fn stalled_peer_trips_the_call_deadline() -> Result<()> {
    // A listener that accepts and then ignores the socket entirely.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        // Hold the connection open without ever answering.
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(stream);
    });

    let peer = Peer::new(7, addr);
    let started = Instant::now();
    let err = peer
        .call(&Request::GetStatus {
            tx_id: Uuid::new_v4(),
        })
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::Timeout), "got {err}");
    assert!(
        elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(7),
        "deadline fired after {elapsed:?}"
    );
    Ok(())
}
