//! End-to-end client/server sessions over an in-process byte stream.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use rstyx::proto::DEFAULT_MSIZE;
    use rstyx::server::MemDir;
    use rstyx::{
        ClientConfig, Connection, Error, FileEvent, OpenMode, Server, ServerConfig, StyxFile,
    };

    const CLOCK: &str = "Thu Aug 13 17:32:07 BST 2026";

    /// Honors RUST_LOG so a failing session can be traced.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn demo_tree() -> Arc<MemDir> {
        let root = MemDir::root();
        root.put_file("date", CLOCK).unwrap();
        let usr = root.mkdir("usr").unwrap();
        usr.put_file("notes", "hello").unwrap();
        root
    }

    async fn connect_with(
        root: Arc<MemDir>,
        client: ClientConfig,
        server: ServerConfig,
    ) -> Arc<Connection> {
        init_tracing();
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let server = Arc::new(Server::with_config(root, server));
        tokio::spawn(async move {
            let _ = server.handle(server_end).await;
        });
        Connection::connect(client_end, client).await.unwrap()
    }

    async fn connect(root: Arc<MemDir>) -> Arc<Connection> {
        connect_with(root, ClientConfig::default(), ServerConfig::default()).await
    }

    #[tokio::test]
    async fn test_read_whole_file() -> anyhow::Result<()> {
        let conn = connect(demo_tree()).await;
        let file = conn.file("date");

        let qid = file.open(OpenMode::READ).await?;
        assert!(!qid.is_dir());

        let data = file.read_at(0, 1024).await?;
        assert_eq!(data, Bytes::from(CLOCK));

        // Zero-length read signals end of file.
        let eof = file.read_at(data.len() as u64, 1024).await?;
        assert!(eof.is_empty());

        file.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_read_opens_on_demand() -> anyhow::Result<()> {
        let conn = connect(demo_tree()).await;
        let file = conn.file("usr/notes");

        // No explicit open; read_at does it with read access.
        let data = file.read_at(0, 64).await?;
        assert_eq!(data, Bytes::from("hello"));
        assert!(file.is_open());
        Ok(())
    }

    #[tokio::test]
    async fn test_stat_reports_metadata() -> anyhow::Result<()> {
        let conn = connect(demo_tree()).await;

        let stat = conn.file("date").stat().await?;
        assert_eq!(stat.name, "date");
        assert_eq!(stat.length, CLOCK.len() as u64);
        assert!(!stat.is_dir());

        let stat = conn.file("usr").stat().await?;
        assert!(stat.is_dir());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_files_name_the_failing_element() {
        let conn = connect(demo_tree()).await;

        let err = conn.file("ghost").open(OpenMode::READ).await.unwrap_err();
        assert!(matches!(&err, Error::NotFound(name) if name == "ghost"), "got {err:?}");

        // The first unresolved element is reported, not the whole path.
        let err = conn
            .file("usr/ghost/deeper")
            .open(OpenMode::READ)
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::NotFound(name) if name == "ghost"), "got {err:?}");

        // The connection stays healthy afterwards.
        assert!(conn.file("date").stat().await.is_ok());
    }

    #[tokio::test]
    async fn test_create_write_read_back() -> anyhow::Result<()> {
        let conn = connect(demo_tree()).await;
        let draft = conn.file("usr/draft");

        draft.create(0o644, OpenMode::RDWR).await?;
        let n = draft.write_at(0, Bytes::from("first cut")).await?;
        assert_eq!(n, 9);
        assert_eq!(draft.read_at(0, 64).await?, Bytes::from("first cut"));

        // Visible through an independent handle too.
        let again = conn.file("usr/draft");
        assert_eq!(again.stat().await?.length, 9);
        Ok(())
    }

    #[tokio::test]
    async fn test_open_or_create() -> anyhow::Result<()> {
        let conn = connect(demo_tree()).await;

        // Existing file: opened, content untouched.
        let notes = conn.file("usr/notes");
        notes.open_or_create(0o644, OpenMode::READ).await?;
        assert_eq!(notes.read_at(0, 64).await?, Bytes::from("hello"));

        // Missing file: created empty.
        let fresh = conn.file("usr/fresh");
        fresh.open_or_create(0o644, OpenMode::RDWR).await?;
        assert!(fresh.read_at(0, 64).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_children_listing() -> anyhow::Result<()> {
        let conn = connect(demo_tree()).await;

        let names: Vec<String> = conn
            .root()
            .children()
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["date", "usr"]);

        let names: Vec<String> = conn
            .file("usr")
            .children()
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["notes"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_listing_spans_multiple_reads() -> anyhow::Result<()> {
        let root = demo_tree();
        let big = root.mkdir("big").unwrap();
        for i in 0..300 {
            big.put_file(&format!("file{i:03}"), "x").unwrap();
        }
        let conn = connect(root).await;

        // 300 stat records exceed one msize worth of directory data.
        let entries = conn.file("big").children().await?;
        assert_eq!(entries.len(), 300);
        assert_eq!(entries[0].name, "file000");
        assert_eq!(entries[299].name, "file299");
        Ok(())
    }

    #[tokio::test]
    async fn test_children_of_a_file_is_refused() {
        let conn = connect(demo_tree()).await;
        let err = conn.file("date").children().await.unwrap_err();
        assert!(
            matches!(err, Error::Usage(_) | Error::Consistency(_)),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_rename_via_wstat() -> anyhow::Result<()> {
        let conn = connect(demo_tree()).await;
        let notes = conn.file("usr/notes");

        notes.rename("letters").await?;
        assert_eq!(notes.path(), "usr/letters");
        assert_eq!(notes.stat().await?.name, "letters");

        // The old name is gone, the new one resolves from scratch.
        let err = conn.file("usr/notes").stat().await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
        assert_eq!(
            conn.file("usr/letters").read_at(0, 64).await?,
            Bytes::from("hello")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_set_length_truncates() -> anyhow::Result<()> {
        let conn = connect(demo_tree()).await;
        let notes = conn.file("usr/notes");

        notes.set_length(2).await?;
        assert_eq!(notes.stat().await?.length, 2);
        assert_eq!(notes.read_at(0, 64).await?, Bytes::from("he"));
        Ok(())
    }

    #[tokio::test]
    async fn test_remove() -> anyhow::Result<()> {
        let conn = connect(demo_tree()).await;

        let tmp = conn.file("usr/tmp");
        tmp.create(0o644, OpenMode::WRITE).await?;
        tmp.remove().await?;

        let err = conn.file("usr/tmp").stat().await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "got {err:?}");

        // The root itself cannot be removed, and the error is not fatal.
        let err = conn.root().remove().await.unwrap_err();
        assert!(err.to_string().contains("root"), "got {err:?}");
        assert!(conn.file("date").stat().await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_refuses_populated_directory() -> anyhow::Result<()> {
        let conn = connect(demo_tree()).await;

        let err = conn.file("usr").remove().await.unwrap_err();
        assert!(err.to_string().contains("not empty"), "got {err:?}");

        conn.file("usr/notes").remove().await?;
        conn.file("usr").remove().await?;
        let names: Vec<String> = conn
            .root()
            .children()
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["date"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_msize_negotiation_takes_the_smaller_side() {
        let conn = connect_with(
            demo_tree(),
            ClientConfig::default(),
            ServerConfig { msize: 4096 },
        )
        .await;
        assert_eq!(conn.msize(), 4096);

        let conn = connect_with(
            demo_tree(),
            ClientConfig {
                msize: 2048,
                ..ClientConfig::default()
            },
            ServerConfig::default(),
        )
        .await;
        assert_eq!(conn.msize(), 2048);
        assert!(conn.msize() < DEFAULT_MSIZE);
    }

    #[tokio::test]
    async fn test_concurrent_operations_share_the_connection() -> anyhow::Result<()> {
        let conn = connect(demo_tree()).await;

        let date = conn.file("date");
        let notes = conn.file("usr/notes");
        let listing = conn.root();
        let (a, b, c) = tokio::join!(
            date.read_at(0, 1024),
            notes.read_at(0, 1024),
            listing.children(),
        );
        assert_eq!(a?, Bytes::from(CLOCK));
        assert_eq!(b?, Bytes::from("hello"));
        assert_eq!(c?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_reopen_with_cached_access_is_a_no_op() -> anyhow::Result<()> {
        let conn = connect(demo_tree()).await;
        let file = conn.file("date");

        let first = file.open(OpenMode::READ).await?;
        let second = file.open(OpenMode::READ).await?;
        assert_eq!(first, second);

        // Conflicting access on an open handle is refused client-side.
        let err = file.open(OpenMode::WRITE).await.unwrap_err();
        assert!(matches!(err, Error::Usage(_)), "got {err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn test_close_and_reopen() -> anyhow::Result<()> {
        let conn = connect(demo_tree()).await;
        let file = conn.file("date");

        file.open(OpenMode::READ).await?;
        file.close().await?;
        assert!(!file.is_open());
        // Closing again is harmless.
        file.close().await?;

        assert_eq!(file.read_at(0, 1024).await?, Bytes::from(CLOCK));
        Ok(())
    }

    #[tokio::test]
    async fn test_events_follow_the_file_lifecycle() -> anyhow::Result<()> {
        let conn = connect(demo_tree()).await;
        let draft = conn.file("usr/draft");
        let mut events = draft.subscribe();

        draft.create(0o644, OpenMode::WRITE).await?;
        draft.write_at(0, Bytes::from("x")).await?;
        draft.close().await?;

        assert!(matches!(events.recv().await?, FileEvent::Created { .. }));
        assert!(matches!(
            events.recv().await?,
            FileEvent::Written { offset: 0, count: 1 }
        ));
        assert!(matches!(events.recv().await?, FileEvent::Closed));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_operations_emit_events() -> anyhow::Result<()> {
        let conn = connect(demo_tree()).await;
        let ghost = conn.file("ghost");
        let mut events = ghost.subscribe();

        let _ = ghost.open(OpenMode::READ).await;
        match events.recv().await? {
            FileEvent::OperationFailed { operation, .. } => assert_eq!(operation, "open"),
            other => panic!("expected OperationFailed, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_operations_after_close_fail_cleanly() {
        let conn = connect(demo_tree()).await;
        let file = conn.file("date");
        assert!(file.stat().await.is_ok());

        conn.close();
        assert!(conn.is_closed());
        let err = file.read_at(0, 64).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_server_survives_many_sequential_clients() -> anyhow::Result<()> {
        let root = demo_tree();
        for _ in 0..3 {
            let conn = connect(root.clone()).await;
            assert_eq!(conn.file("date").read_at(0, 64).await?, Bytes::from(CLOCK));
            conn.close();
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_handles_are_cheap_clones() -> anyhow::Result<()> {
        let conn = connect(demo_tree()).await;
        let file = conn.file("date");
        let twin: StyxFile = file.clone();

        file.open(OpenMode::READ).await?;
        // The clone shares fid state with the original.
        assert!(twin.is_open());
        assert_eq!(twin.read_at(0, 4).await?, Bytes::from("Thu "));
        Ok(())
    }
}
