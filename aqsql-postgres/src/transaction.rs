//! Transaction scopes with Drop-triggered rollback.
//!
//! Grounded directly on the teacher's `Rollback` guard in
//! `PgTransactionManager::begin`, refcounted the way the original
//! library's transaction handle is: `original_source/demos/async1/
//! transactions.cpp` copies its transaction object by value into several
//! closures, any of which can later `commit()` it, and only the last
//! copy going out of scope (with nothing committed or rolled back yet)
//! triggers the implicit rollback.

use std::sync::{Arc, Mutex};

use aqsql_core::Result;

use crate::driver::Database;

struct TransactionState {
    db: Database,
    armed: bool,
}

impl Drop for TransactionState {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort: the worker is sent the ROLLBACK and we move
            // on. There's no sync `Drop` point to await the result from,
            // matching `start_rollback`'s fire-and-forget shape.
            let db = self.db.clone();
            tokio::spawn(async move {
                if let Err(err) = db.exec("ROLLBACK", Vec::new()).await {
                    tracing::warn!(error = %err, "rollback-on-drop failed");
                }
            });
        }
    }
}

/// A refcounted handle to an open transaction on a [`Database`]. Cloning
/// it shares the same underlying `BEGIN` scope: every clone can `commit`
/// or `rollback` it, and the rollback-on-drop guard fires only once the
/// last clone is dropped without either happening first.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Mutex<TransactionState>>,
}

impl Transaction {
    pub(crate) async fn begin(db: Database) -> Result<Self> {
        db.exec("BEGIN", Vec::new()).await?;
        Ok(Transaction {
            inner: Arc::new(Mutex::new(TransactionState { db, armed: true })),
        })
    }

    pub async fn commit(&self) -> Result<()> {
        let db = {
            let mut state = self.inner.lock().expect("transaction mutex poisoned");
            state.armed = false;
            state.db.clone()
        };
        db.exec("COMMIT", Vec::new()).await?;
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        let db = {
            let mut state = self.inner.lock().expect("transaction mutex poisoned");
            state.armed = false;
            state.db.clone()
        };
        db.exec("ROLLBACK", Vec::new()).await?;
        Ok(())
    }

    pub fn database(&self) -> Database {
        self.inner.lock().expect("transaction mutex poisoned").db.clone()
    }
}

impl Database {
    pub async fn begin(&self) -> Result<Transaction> {
        Transaction::begin(self.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use aqsql_core::{ConnectOptions, Target};

    use crate::driver::{ConnectionState, Database};

    use super::*;

    /// Answers startup plus every Parse/Bind/Describe/Execute/Sync with a
    /// canned response, recording the query text of each `Parse` message
    /// it sees into `seen` so the test can assert on what ran.
    async fn run_fake_server(mut server: DuplexStream, seen: Arc<Mutex<Vec<String>>>) {
        let mut len_buf = [0u8; 4];
        server.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len - 4];
        server.read_exact(&mut body).await.unwrap();

        write_frame(&mut server, b'R', &0u32.to_be_bytes()).await;
        write_frame(&mut server, b'Z', b"I").await;

        loop {
            let mut header = [0u8; 5];
            if server.read_exact(&mut header).await.is_err() {
                return;
            }
            let tag = header[0];
            let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
            let mut body = vec![0u8; len - 4];
            server.read_exact(&mut body).await.unwrap();

            match tag {
                b'P' => {
                    let name_end = body.iter().position(|&b| b == 0).unwrap();
                    let query_end = name_end + 1 + body[name_end + 1..].iter().position(|&b| b == 0).unwrap();
                    let sql = String::from_utf8_lossy(&body[name_end + 1..query_end]).into_owned();
                    seen.lock().unwrap().push(sql);
                    write_frame(&mut server, b'1', &[]).await;
                }
                b'B' => write_frame(&mut server, b'2', &[]).await,
                b'D' => write_frame(&mut server, b'n', &[]).await,
                b'E' => write_frame(&mut server, b'C', b"OK\0").await,
                b'S' => write_frame(&mut server, b'Z', b"I").await,
                b'X' => return,
                other => panic!("fake server saw unexpected frontend tag {:?}", other as char),
            }
        }
    }

    async fn write_frame(server: &mut DuplexStream, tag: u8, body: &[u8]) {
        let mut frame = vec![tag];
        frame.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        frame.extend_from_slice(body);
        server.write_all(&frame).await.unwrap();
    }

    async fn connected(seen: Arc<Mutex<Vec<String>>>) -> Database {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(run_fake_server(server, seen));
        let options = ConnectOptions {
            target: Target::Tcp { host: "unused".into(), port: 0 },
            username: "tester".into(),
            password: None,
            database: Some("test".into()),
            application_name: None,
            statement_cache_capacity: 100,
            runtime_params: BTreeMap::new(),
            log_settings: Default::default(),
        };
        let db = Database::spawn(Box::new(client), options);
        let mut state = db.on_state_changed();
        while *state.borrow() == ConnectionState::Connecting {
            state.changed().await.unwrap();
        }
        db
    }

    #[tokio::test]
    async fn rolls_back_when_every_clone_is_dropped_without_commit() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let db = connected(seen.clone()).await;

        {
            let tx = db.begin().await.unwrap();
            let _tx2 = tx.clone();
            // both clones dropped here, with neither commit nor rollback called
        }

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let queries = seen.lock().unwrap().clone();
        assert!(queries.contains(&"BEGIN".to_owned()));
        assert!(queries.contains(&"ROLLBACK".to_owned()), "expected an implicit rollback, saw {queries:?}");
    }

    #[tokio::test]
    async fn commit_through_one_clone_suppresses_rollback_on_the_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let db = connected(seen.clone()).await;

        let tx = db.begin().await.unwrap();
        let tx2 = tx.clone();
        tx.commit().await.unwrap();
        drop(tx);
        drop(tx2);

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let queries = seen.lock().unwrap().clone();
        assert!(queries.contains(&"COMMIT".to_owned()));
        assert!(!queries.contains(&"ROLLBACK".to_owned()), "commit should defuse the rollback guard, saw {queries:?}");
    }
}
