//! Concurrent use of a shared client and connection.

#[cfg(test)]
mod tests {
    use crate::harness::{small_scheme, upload, TestEnv};
    use metainfo_client::{Context, ListOptions, Operation, SegmentLocator};
    use tokio::task::JoinSet;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shared_client_concurrent_lifecycles() {
        let env = TestEnv::new(12).await;
        let client = env.client();
        let mut tasks = JoinSet::new();

        for i in 0..32u32 {
            let client = client.clone();
            tasks.spawn(async move {
                let ctx = Context::background();
                let loc = SegmentLocator::last("shared", format!("obj-{i:02}").into_bytes());
                let committed = upload(&client, &ctx, &loc, &small_scheme()).await?;
                let (read, aligned) = client.read_segment(&ctx, &loc).await?;
                assert_eq!(read.root_piece_id, committed.root_piece_id);
                assert_eq!(aligned.present(), 5);
                client.delete_segment(&ctx, &loc).await?;
                Ok::<_, metainfo_client::MetainfoError>(())
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        let snap = env.metrics().snapshot();
        for op in [
            Operation::CreateSegment,
            Operation::CommitSegment,
            Operation::ReadSegment,
            Operation::DeleteSegment,
        ] {
            let stats = snap.get(op).unwrap();
            assert_eq!(stats.calls, 32, "{op}");
            assert_eq!(stats.successes, 32, "{op}");
        }

        let page = client
            .list_segments(&Context::background(), "shared", ListOptions::default())
            .await
            .unwrap();
        assert!(page.items.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_of_one_segment() {
        let env = TestEnv::new(5).await;
        let loc = SegmentLocator::last("shared", b"hot".to_vec());
        let committed = upload(&env.client(), &Context::background(), &loc, &small_scheme())
            .await
            .unwrap();

        let mut tasks = JoinSet::new();
        for _ in 0..16 {
            let client = env.client();
            let loc = loc.clone();
            tasks.spawn(async move { client.read_segment(&Context::background(), &loc).await });
        }
        while let Some(joined) = tasks.join_next().await {
            let (pointer, aligned) = joined.unwrap().unwrap();
            assert_eq!(pointer, committed);
            assert_eq!(aligned.len(), 5);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_conflicting_attribution() {
        let env = TestEnv::new(1).await;
        let mut tasks = JoinSet::new();
        for _ in 0..8 {
            let client = env.client();
            tasks.spawn(async move {
                client
                    .set_attribution(&Context::background(), "contested", uuid::Uuid::new_v4())
                    .await
            });
        }
        let mut accepted = 0;
        while let Some(joined) = tasks.join_next().await {
            if joined.unwrap().is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert!(env.coordinator().attribution(b"contested").is_some());
    }
}
