// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use crate::storage::traits::{Command, TagCacheError, TagStore, Topology};

/// How a group of commands reaches the store.
///
/// Chosen once per call from the store topology, so the flush algorithms run
/// the same steps on both topologies and only this dispatch differs.
#[derive(Clone, Copy)]
pub enum BatchClient<'a> {
    /// One command per round-trip; never a cross-slot atomic pipeline.
    Cluster(&'a dyn TagStore),
    /// The whole group in one atomic pipeline (MULTI/EXEC).
    Pipelined(&'a dyn TagStore),
}

impl<'a> BatchClient<'a> {
    pub fn for_store(store: &'a dyn TagStore) -> Self {
        match store.topology() {
            Topology::Cluster => BatchClient::Cluster(store),
            Topology::Standalone => BatchClient::Pipelined(store),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BatchClient::Cluster(_) => "cluster",
            BatchClient::Pipelined(_) => "pipelined",
        }
    }

    /// Send the non-empty commands of `commands`.
    ///
    /// Replies line up with the input; skipped (empty) commands reply `None`.
    pub async fn run(&self, commands: Vec<Command>) -> Result<Vec<Option<i64>>, TagCacheError> {
        let mut replies = vec![None; commands.len()];
        let mut positions = Vec::with_capacity(commands.len());
        let mut sent = Vec::with_capacity(commands.len());
        for (i, command) in commands.into_iter().enumerate() {
            if !command.is_empty() {
                positions.push(i);
                sent.push(command);
            }
        }

        if sent.is_empty() {
            return Ok(replies);
        }

        let values = match self {
            BatchClient::Cluster(store) => store.execute(&sent).await?,
            BatchClient::Pipelined(store) => store.execute_pipeline(&sent).await?,
        };
        for (position, value) in positions.into_iter().zip(values) {
            replies[position] = Some(value);
        }
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryTagStore;

    #[tokio::test]
    async fn test_selected_by_topology() {
        let standalone = MemoryTagStore::new();
        let cluster = MemoryTagStore::cluster();

        assert_eq!(BatchClient::for_store(&standalone).kind(), "pipelined");
        assert_eq!(BatchClient::for_store(&cluster).kind(), "cluster");
    }

    #[tokio::test]
    async fn test_empty_groups_are_skipped() {
        let store = MemoryTagStore::new();
        let client = BatchClient::for_store(&store);

        let replies = client
            .run(vec![
                Command::Del(vec![]),
                Command::Unlink(vec!["a".into()]),
                Command::HDel { key: "h".into(), fields: vec![] },
            ])
            .await
            .unwrap();

        assert_eq!(replies, vec![None, Some(0), None]);
        let calls = store.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].commands, vec![Command::Unlink(vec!["a".into()])]);
    }

    #[tokio::test]
    async fn test_all_empty_issues_nothing() {
        let store = MemoryTagStore::new();
        let replies = BatchClient::for_store(&store)
            .run(vec![Command::Del(vec![]), Command::Unlink(vec![])])
            .await
            .unwrap();

        assert_eq!(replies, vec![None, None]);
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cluster_sends_one_command_per_round_trip() {
        let store = MemoryTagStore::cluster();
        BatchClient::for_store(&store)
            .run(vec![Command::Del(vec!["a".into()]), Command::Unlink(vec!["b".into()])])
            .await
            .unwrap();

        assert_eq!(store.round_trips(), 2);
        assert!(store.calls().iter().all(|c| !c.pipelined));
    }
}
