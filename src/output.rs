//! CSV sinks.
//!
//! Worker tasks never write output themselves: they send batches of rows
//! over a bounded channel to one writer thread, so rows never interleave.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Mutex;
use std::thread::JoinHandle;

use camino::Utf8Path as Path;
use serde::Serialize;

use crate::{Error, Result};

/// Bound on batches waiting for the writer.
pub const CHANNEL_BOUND: usize = 1024;

/// A row type with a fixed CSV header.
pub trait ResultType: Serialize {
    fn header_fields() -> &'static [&'static str];
}

/// Destination for batches of result rows produced by worker tasks.
///
/// Each batch holds the rows of one query, already ordered.
pub trait ResultSink<T>: Sync {
    fn emit(&self, batch: Vec<T>) -> Result<()>;
}

impl<T: Send> ResultSink<T> for SyncSender<Vec<T>> {
    fn emit(&self, batch: Vec<T>) -> Result<()> {
        self.send(batch).map_err(|_| Error::Output {
            message: "writer thread stopped early".into(),
        })
    }
}

/// Collects batches in memory, in arrival order.
impl<T: Send> ResultSink<T> for Mutex<Vec<Vec<T>>> {
    fn emit(&self, batch: Vec<T>) -> Result<()> {
        self.lock()
            .map_err(|e| Error::Output {
                message: e.to_string(),
            })?
            .push(batch);
        Ok(())
    }
}

pub fn result_channel<T>() -> (SyncSender<Vec<T>>, Receiver<Vec<T>>) {
    sync_channel(CHANNEL_BOUND)
}

/// Open `output` for writing, or stdout when no path is given.
pub fn open_stdout_or_file<P: AsRef<Path>>(output: Option<P>) -> Result<Box<dyn Write + Send>> {
    match output {
        Some(path) => {
            let path = path.as_ref();
            let file = File::create(path).map_err(|e| Error::Output {
                message: format!("cannot create '{}': {}", path, e),
            })?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(std::io::stdout())),
    }
}

fn csv_writer<W: Write, T: ResultType>(out: W) -> Result<csv::Writer<W>> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(out);
    writer.write_record(T::header_fields())?;
    Ok(writer)
}

/// Spawn the single writer thread for rows of type `T`.
///
/// The output file is created before the thread starts. The thread ends
/// once every sender is dropped and returns the number of rows written.
pub fn csvwriter_thread<T, P>(
    recv: Receiver<Vec<T>>,
    output: Option<P>,
) -> Result<JoinHandle<Result<usize>>>
where
    T: ResultType + Send + 'static,
    P: AsRef<Path>,
{
    let out = open_stdout_or_file(output)?;

    Ok(std::thread::spawn(move || -> Result<usize> {
        let mut writer = csv_writer::<_, T>(out)?;
        let mut n_rows = 0;
        for batch in recv.iter() {
            for row in batch {
                writer.serialize(row)?;
                n_rows += 1;
            }
            writer.flush()?;
        }
        writer.flush()?;
        Ok(n_rows)
    }))
}

/// Wait for a writer thread and surface its error, if any.
pub fn join_writer(handle: JoinHandle<Result<usize>>) -> Result<usize> {
    handle.join().map_err(|_| Error::Output {
        message: "writer thread panicked".into(),
    })?
}

/// Write all `rows` to `output` from the calling thread.
pub fn write_csv<T, P>(rows: &[T], output: Option<P>) -> Result<()>
where
    T: ResultType,
    P: AsRef<Path>,
{
    let mut writer = csv_writer::<_, T>(open_stdout_or_file(output)?)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use camino::Utf8PathBuf as PathBuf;

    use super::*;

    #[derive(Serialize)]
    struct Row {
        name: String,
        value: f64,
    }

    impl ResultType for Row {
        fn header_fields() -> &'static [&'static str] {
            &["name", "value"]
        }
    }

    #[test]
    fn writer_thread_keeps_batches_together() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = PathBuf::from_path_buf(tmp.path().join("out.csv")).unwrap();

        let (send, recv) = result_channel::<Row>();
        let handle = csvwriter_thread(recv, Some(&path)).unwrap();

        let senders: Vec<_> = (0..4).map(|_| send.clone()).collect();
        drop(send);
        std::thread::scope(|s| {
            for (i, tx) in senders.into_iter().enumerate() {
                s.spawn(move || {
                    let batch = (0..3)
                        .map(|j| Row {
                            name: format!("q{i}, \"quoted\""),
                            value: j as f64,
                        })
                        .collect();
                    tx.send(batch).unwrap();
                });
            }
        });

        assert_eq!(join_writer(handle).unwrap(), 12);

        let mut rdr = csv::Reader::from_path(&path).unwrap();
        assert_eq!(rdr.headers().unwrap(), vec!["name", "value"]);
        let names: Vec<String> = rdr
            .records()
            .map(|r| r.unwrap()[0].to_string())
            .collect();
        assert_eq!(names.len(), 12);
        for chunk in names.chunks(3) {
            assert!(chunk.iter().all(|n| n == &chunk[0]));
        }
    }

    #[test]
    fn header_written_without_rows() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = PathBuf::from_path_buf(tmp.path().join("empty.csv")).unwrap();
        write_csv::<Row, _>(&[], Some(&path)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "name,value\n");
    }
}
