//! File-backed implementation of the replicated-log client.
//!
//! A single-node stand-in for the external replicated log, good enough for
//! deployments that accept coordinator-local durability. All file I/O runs
//! on a dedicated logger task; callers talk to it over a channel and await
//! their result, so appends from concurrent tasks serialize in a total
//! order and ids come out strictly increasing.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::Path;

use crate::journal::{EntryId, LogClient, Record};
use crate::utils::RosterError;

use async_trait::async_trait;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{Deserialize, Serialize};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// On-disk frame. Invalidation is recorded as its own frame rather than by
/// rewriting old frames, so the file stays append-only; the live set is
/// reconstructed by a forward scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Frame {
    Append {
        id: EntryId,
        invalidates: Vec<EntryId>,
        record: Record,
    },
    Invalidate {
        ids: Vec<EntryId>,
    },
}

/// Command sent to the logger task.
enum LogAction {
    Append {
        record: Record,
        invalidates: Vec<EntryId>,
        done: oneshot::Sender<Result<EntryId, RosterError>>,
    },
    Invalidate {
        ids: Vec<EntryId>,
        done: oneshot::Sender<Result<(), RosterError>>,
    },
    ReadAll {
        done: oneshot::Sender<Vec<(EntryId, Record)>>,
    },
}

/// Durable journal backed by a local append-only file.
pub struct FileLog {
    /// Sender side of the action channel.
    tx_action: mpsc::UnboundedSender<LogAction>,

    /// Join handle of the logger task.
    _logger_handle: JoinHandle<()>,
}

impl FileLog {
    /// Opens (creating if necessary) the backing file at `path`, replays its
    /// frames to rebuild the live set, and spawns the logger task.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RosterError> {
        let path = path.as_ref();
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!("j"; "created journal file '{}'", path.display());
        }
        let mut backer =
            OpenOptions::new().read(true).write(true).open(path).await?;

        let (live, next_id, valid_size) = Self::scan_frames(&mut backer).await?;
        let file_size = backer.metadata().await?.len();
        if valid_size < file_size {
            // a torn tail frame from an earlier crash; drop it
            pf_warn!(
                "j";
                "truncating torn journal tail: {} -> {} bytes",
                file_size,
                valid_size
            );
            backer.set_len(valid_size).await?;
        }
        backer.seek(SeekFrom::End(0)).await?;
        pf_info!(
            "j";
            "journal '{}' opened with {} live records",
            path.display(),
            live.len()
        );

        let (tx_action, rx_action) = mpsc::unbounded_channel();
        let logger_handle =
            tokio::spawn(Self::logger_task(backer, live, next_id, rx_action));

        Ok(FileLog {
            tx_action,
            _logger_handle: logger_handle,
        })
    }

    /// Scans all complete frames from the start of the file. Returns the
    /// reconstructed live set, the next entry id, and the byte offset just
    /// past the last complete frame.
    async fn scan_frames(
        backer: &mut File,
    ) -> Result<(BTreeMap<EntryId, Record>, EntryId, u64), RosterError> {
        let file_size = backer.metadata().await?.len();
        backer.seek(SeekFrom::Start(0)).await?;

        let mut live = BTreeMap::new();
        let mut next_id: EntryId = 1;
        let mut offset: u64 = 0;

        while offset + 8 <= file_size {
            let frame_len = backer.read_u64().await?;
            let frame_end = offset + 8 + frame_len;
            if frame_end > file_size {
                break; // torn tail
            }
            let mut buf = vec![0u8; frame_len as usize];
            backer.read_exact(&mut buf).await?;
            let frame: Frame = match decode_from_slice(&buf) {
                Ok(frame) => frame,
                Err(e) => {
                    pf_warn!("j"; "undecodable journal frame: {}", e);
                    break;
                }
            };
            match frame {
                Frame::Append {
                    id,
                    invalidates,
                    record,
                } => {
                    for inv in invalidates {
                        live.remove(&inv);
                    }
                    live.insert(id, record);
                    next_id = next_id.max(id + 1);
                }
                Frame::Invalidate { ids } => {
                    for inv in ids {
                        live.remove(&inv);
                    }
                }
            }
            offset = frame_end;
        }

        Ok((live, next_id, offset))
    }

    /// Appends one frame and syncs it to disk.
    async fn write_frame(
        backer: &mut File,
        frame: &Frame,
    ) -> Result<(), RosterError> {
        let bytes = encode_to_vec(frame)
            .map_err(|e| RosterError::Journal(e.to_string()))?;
        backer.write_u64(bytes.len() as u64).await?;
        backer.write_all(&bytes).await?;
        backer.sync_data().await?;
        Ok(())
    }

    /// Logger task: owns the backing file and the live-record mirror.
    async fn logger_task(
        mut backer: File,
        mut live: BTreeMap<EntryId, Record>,
        mut next_id: EntryId,
        mut rx_action: mpsc::UnboundedReceiver<LogAction>,
    ) {
        pf_debug!("j"; "logger task spawned");

        while let Some(action) = rx_action.recv().await {
            match action {
                LogAction::Append {
                    record,
                    invalidates,
                    done,
                } => {
                    let result = if let Some(bad) = invalidates
                        .iter()
                        .find(|id| !live.contains_key(*id))
                    {
                        Err(RosterError::Journal(format!(
                            "invalidating unknown entry id {}",
                            bad
                        )))
                    } else {
                        let id = next_id;
                        let frame = Frame::Append {
                            id,
                            invalidates: invalidates.clone(),
                            record: record.clone(),
                        };
                        match Self::write_frame(&mut backer, &frame).await {
                            Ok(()) => {
                                next_id += 1;
                                for inv in &invalidates {
                                    live.remove(inv);
                                }
                                live.insert(id, record);
                                Ok(id)
                            }
                            Err(e) => {
                                Err(RosterError::Journal(e.to_string()))
                            }
                        }
                    };
                    let _ = done.send(result);
                }

                LogAction::Invalidate { ids, done } => {
                    let result = if let Some(bad) =
                        ids.iter().find(|id| !live.contains_key(*id))
                    {
                        Err(RosterError::Journal(format!(
                            "invalidating unknown entry id {}",
                            bad
                        )))
                    } else {
                        let frame = Frame::Invalidate { ids: ids.clone() };
                        match Self::write_frame(&mut backer, &frame).await {
                            Ok(()) => {
                                for inv in &ids {
                                    live.remove(inv);
                                }
                                Ok(())
                            }
                            Err(e) => {
                                Err(RosterError::Journal(e.to_string()))
                            }
                        }
                    };
                    let _ = done.send(result);
                }

                LogAction::ReadAll { done } => {
                    let snapshot = live
                        .iter()
                        .map(|(&id, rec)| (id, rec.clone()))
                        .collect();
                    let _ = done.send(snapshot);
                }
            }
        }

        pf_debug!("j"; "logger task exited");
    }
}

#[async_trait]
impl LogClient for FileLog {
    async fn append(
        &self,
        record: Record,
        invalidates: &[EntryId],
    ) -> Result<EntryId, RosterError> {
        let (done, wait) = oneshot::channel();
        self.tx_action
            .send(LogAction::Append {
                record,
                invalidates: invalidates.to_vec(),
                done,
            })
            .map_err(|e| RosterError::Journal(e.to_string()))?;
        wait.await
            .map_err(|e| RosterError::Journal(e.to_string()))?
    }

    async fn invalidate(&self, ids: &[EntryId]) -> Result<(), RosterError> {
        let (done, wait) = oneshot::channel();
        self.tx_action
            .send(LogAction::Invalidate {
                ids: ids.to_vec(),
                done,
            })
            .map_err(|e| RosterError::Journal(e.to_string()))?;
        wait.await
            .map_err(|e| RosterError::Journal(e.to_string()))?
    }

    async fn read_all(&self) -> Result<Vec<(EntryId, Record)>, RosterError> {
        let (done, wait) = oneshot::channel();
        self.tx_action
            .send(LogAction::ReadAll { done })
            .map_err(|e| RosterError::Journal(e.to_string()))?;
        wait.await.map_err(|e| RosterError::Journal(e.to_string()))
    }
}

#[cfg(test)]
mod filelog_tests {
    use super::*;
    use crate::ids::ServerId;

    async fn fresh_log(path: &str) -> Result<FileLog, RosterError> {
        if fs::try_exists(path).await? {
            fs::remove_file(path).await?;
        }
        FileLog::open(path).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn append_and_read_back() -> Result<(), RosterError> {
        let log = fresh_log("/tmp/test-roster-journal-0.log").await?;
        let a = log
            .append(
                Record::ServerNeedsRecovery {
                    server_id: ServerId::new(2, 0),
                },
                &[],
            )
            .await?;
        let b = log
            .append(Record::ServerListVersion { version: 4 }, &[])
            .await?;
        assert!(b > a);
        let records = log.read_all().await?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, a);
        assert_eq!(records[1].1, Record::ServerListVersion { version: 4 });
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn live_set_survives_reopen() -> Result<(), RosterError> {
        let path = "/tmp/test-roster-journal-1.log";
        let id;
        {
            let log = fresh_log(path).await?;
            let old = log
                .append(Record::ServerListVersion { version: 1 }, &[])
                .await?;
            id = log
                .append(Record::ServerListVersion { version: 2 }, &[old])
                .await?;
            log.invalidate(&[]).await?;
        }
        let log = FileLog::open(path).await?;
        let records = log.read_all().await?;
        assert_eq!(
            records,
            vec![(id, Record::ServerListVersion { version: 2 })]
        );
        // ids keep increasing after reopen
        let next = log
            .append(Record::ServerListVersion { version: 3 }, &[id])
            .await?;
        assert!(next > id);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn torn_tail_dropped() -> Result<(), RosterError> {
        let path = "/tmp/test-roster-journal-2.log";
        {
            let log = fresh_log(path).await?;
            log.append(Record::ServerListVersion { version: 9 }, &[])
                .await?;
        }
        // simulate a crash mid-append by writing half a frame header
        {
            let mut file = OpenOptions::new().append(true).open(path).await?;
            file.write_all(&[0xde, 0xad, 0xbe]).await?;
            file.sync_data().await?;
        }
        let log = FileLog::open(path).await?;
        let records = log.read_all().await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1, Record::ServerListVersion { version: 9 });
        Ok(())
    }
}
