//! Windowed download/upload pipelines exercised end to end.

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use rstyx::proto::{Qid, QidType, Stat};
    use rstyx::server::MemDir;
    use rstyx::{
        ClientConfig, Connection, Error, FileEvent, Node, OpenMode, Server, ServerConfig,
    };

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    /// Honors RUST_LOG so a failing transfer can be traced.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    async fn connect_with(root: Arc<MemDir>, client: ClientConfig) -> Arc<Connection> {
        init_tracing();
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let server = Arc::new(Server::with_config(root, ServerConfig::default()));
        tokio::spawn(async move {
            let _ = server.handle(server_end).await;
        });
        Connection::connect(client_end, client).await.unwrap()
    }

    async fn connect(root: Arc<MemDir>) -> Arc<Connection> {
        connect_with(root, ClientConfig::default()).await
    }

    #[tokio::test]
    async fn test_download_large_file() -> anyhow::Result<()> {
        let data = pattern(100_000);
        let root = MemDir::root();
        root.put_file("blob", data.clone()).unwrap();
        let conn = connect(root).await;

        let mut sink = Cursor::new(Vec::new());
        let got = conn.file("blob").download_to(&mut sink).await?;
        assert_eq!(got, data.len() as u64);
        assert_eq!(sink.into_inner(), data);
        Ok(())
    }

    #[tokio::test]
    async fn test_download_empty_file() -> anyhow::Result<()> {
        let root = MemDir::root();
        root.put_file("empty", "").unwrap();
        let conn = connect(root).await;

        let mut sink = Cursor::new(Vec::new());
        assert_eq!(conn.file("empty").download_to(&mut sink).await?, 0);
        assert!(sink.into_inner().is_empty());
        Ok(())
    }

    /// Yields at most 1000 bytes per read no matter what was asked,
    /// forcing the downloader through its short-read recovery.
    struct Trickle {
        qid: Qid,
        content: Vec<u8>,
    }

    #[async_trait]
    impl Node for Trickle {
        fn qid(&self) -> Qid {
            self.qid
        }

        fn stat(&self) -> Stat {
            Stat {
                typ: 0,
                dev: 0,
                qid: self.qid,
                mode: 0o644,
                atime: 0,
                mtime: 0,
                length: self.content.len() as u64,
                name: "trickle".to_string(),
                uid: "styx".to_string(),
                gid: "styx".to_string(),
                muid: "styx".to_string(),
            }
        }

        async fn read(&self, offset: u64, count: u32) -> rstyx::Result<Bytes> {
            let len = self.content.len() as u64;
            if offset >= len {
                return Ok(Bytes::new());
            }
            let end = len.min(offset + count.min(1000) as u64);
            Ok(Bytes::copy_from_slice(
                &self.content[offset as usize..end as usize],
            ))
        }
    }

    #[tokio::test]
    async fn test_download_recovers_from_short_reads() -> anyhow::Result<()> {
        let data = pattern(25_000);
        let root = MemDir::root();
        let qid = Qid {
            typ: QidType::FILE,
            version: 0,
            path: 999,
        };
        root.mount(
            "trickle",
            Arc::new(Trickle {
                qid,
                content: data.clone(),
            }),
        )
        .unwrap();
        let conn = connect(root).await;

        let mut sink = Cursor::new(Vec::new());
        let got = conn.file("trickle").download_to(&mut sink).await?;
        assert_eq!(got, data.len() as u64);
        assert_eq!(sink.into_inner(), data);
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_creates_and_stores() -> anyhow::Result<()> {
        let data = pattern(60_000);
        let conn = connect(MemDir::root()).await;

        let blob = conn.file("blob");
        let mut source: &[u8] = &data;
        let sent = blob.upload_from(&mut source).await?;
        assert_eq!(sent, data.len() as u64);
        // Uploading hands the fid to the transfer; the handle ends up closed.
        assert!(!blob.is_open());

        let fresh = conn.file("blob");
        assert_eq!(fresh.stat().await?.length, data.len() as u64);
        let mut sink = Cursor::new(Vec::new());
        fresh.download_to(&mut sink).await?;
        assert_eq!(sink.into_inner(), data);
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_truncates_previous_content() -> anyhow::Result<()> {
        let root = MemDir::root();
        root.put_file("notes", "a much longer body of text").unwrap();
        let conn = connect(root).await;

        let mut source: &[u8] = b"abc";
        conn.file("notes").upload_from(&mut source).await?;

        let fresh = conn.file("notes");
        assert_eq!(fresh.stat().await?.length, 3);
        assert_eq!(fresh.read_at(0, 64).await?, Bytes::from("abc"));
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_through_open_handle() -> anyhow::Result<()> {
        let root = MemDir::root();
        root.put_file("notes", "previous").unwrap();
        let conn = connect(root).await;

        let notes = conn.file("notes");
        notes.open(OpenMode::WRITE).await?;
        let mut source: &[u8] = b"fresh";
        notes.upload_from(&mut source).await?;

        assert_eq!(conn.file("notes").read_at(0, 64).await?, Bytes::from("fresh"));
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_empty_source() -> anyhow::Result<()> {
        let conn = connect(MemDir::root()).await;

        let mut source: &[u8] = b"";
        let sent = conn.file("empty").upload_from(&mut source).await?;
        assert_eq!(sent, 0);
        assert_eq!(conn.file("empty").stat().await?.length, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_disk_roundtrip() -> anyhow::Result<()> {
        let data = pattern(40_000);
        let dir = tempfile::tempdir()?;
        let outgoing = dir.path().join("outgoing.bin");
        let returned = dir.path().join("returned.bin");
        std::fs::write(&outgoing, &data)?;

        let conn = connect(MemDir::root()).await;
        let sent = conn.file("blob").upload_from_path(&outgoing).await?;
        assert_eq!(sent, data.len() as u64);

        let got = conn.file("blob").download_to_path(&returned).await?;
        assert_eq!(got, data.len() as u64);
        assert_eq!(std::fs::read(&returned)?, data);
        Ok(())
    }

    #[tokio::test]
    async fn test_background_transfers_report_through_events() -> anyhow::Result<()> {
        let data = pattern(10_000);
        let root = MemDir::root();
        root.put_file("blob", data.clone()).unwrap();
        let conn = connect(root).await;
        let dir = tempfile::tempdir()?;
        let local = dir.path().join("blob.bin");

        let file = conn.file("blob");
        let mut events = file.subscribe();
        file.download_in_background(&local).await?;

        let mut completed = None;
        while let Ok(ev) = events.try_recv() {
            if let FileEvent::DownloadCompleted { bytes } = ev {
                completed = Some(bytes);
            }
        }
        assert_eq!(completed, Some(data.len() as u64));
        assert_eq!(std::fs::read(&local)?, data);

        let upload = conn.file("copy");
        let mut events = upload.subscribe();
        upload.upload_in_background(&local).await?;
        let mut completed = None;
        while let Ok(ev) = events.try_recv() {
            if let FileEvent::UploadCompleted { bytes } = ev {
                completed = Some(bytes);
            }
        }
        assert_eq!(completed, Some(data.len() as u64));
        Ok(())
    }

    /// Never answers reads; used to exercise deadlines.
    struct StuckFile {
        qid: Qid,
    }

    #[async_trait]
    impl Node for StuckFile {
        fn qid(&self) -> Qid {
            self.qid
        }

        fn stat(&self) -> Stat {
            Stat {
                typ: 0,
                dev: 0,
                qid: self.qid,
                mode: 0o644,
                atime: 0,
                mtime: 0,
                length: 1,
                name: "stuck".to_string(),
                uid: "styx".to_string(),
                gid: "styx".to_string(),
                muid: "styx".to_string(),
            }
        }

        async fn read(&self, _offset: u64, _count: u32) -> rstyx::Result<Bytes> {
            std::future::pending().await
        }
    }

    fn stuck_tree() -> Arc<MemDir> {
        let root = MemDir::root();
        let qid = Qid {
            typ: QidType::FILE,
            version: 0,
            path: 999,
        };
        root.mount("stuck", Arc::new(StuckFile { qid })).unwrap();
        root
    }

    #[tokio::test]
    async fn test_request_timeout_flushes_the_read() {
        let conn = connect_with(
            stuck_tree(),
            ClientConfig {
                request_timeout: Some(Duration::from_millis(200)),
                ..ClientConfig::default()
            },
        )
        .await;

        let err = conn.file("stuck").read_at(0, 16).await.unwrap_err();
        assert!(matches!(err, Error::TimedOut), "got {err:?}");
    }

    #[tokio::test]
    async fn test_download_honors_the_deadline() {
        let conn = connect_with(
            stuck_tree(),
            ClientConfig {
                request_timeout: Some(Duration::from_millis(200)),
                ..ClientConfig::default()
            },
        )
        .await;

        let mut sink = Cursor::new(Vec::new());
        let err = conn
            .file("stuck")
            .download_to(&mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TimedOut), "got {err:?}");
    }
}
