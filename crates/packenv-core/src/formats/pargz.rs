//! Block-parallel gzip writer.
//!
//! Keeping a running deflate dictionary across threads would serialize the
//! whole stream, so input is cut into fixed 256 KiB blocks, each raw-deflated
//! independently and terminated with a full flush (byte-aligned, no final
//! bit). Concatenated blocks plus one terminating empty FINISH block form a
//! valid single-member gzip stream; the CRC runs serially over the input,
//! which is cheap. Block boundaries depend only on the byte stream, so the
//! output is identical for any worker count.

use std::io::{self, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use flate2::{Compress, Compression, Crc, FlushCompress, Status};

const BLOCK_SIZE: usize = 256 * 1024;

type BlockResult = io::Result<Vec<u8>>;
type Job = (Vec<u8>, SyncSender<BlockResult>);

pub(crate) struct ParallelGzWriter<W: Write + Send + 'static> {
    jobs: Option<SyncSender<Job>>,
    slots: Option<SyncSender<Receiver<BlockResult>>>,
    workers: Vec<JoinHandle<()>>,
    consumer: Option<JoinHandle<io::Result<W>>>,
    crc: Crc,
    buf: Vec<u8>,
    level: u32,
}

impl<W: Write + Send + 'static> ParallelGzWriter<W> {
    pub(crate) fn new(mut out: W, level: u32, threads: usize) -> io::Result<Self> {
        // Fixed header: no flags, zero mtime, XFL=2, OS=unknown.
        out.write_all(&[0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x02, 0xff])?;

        let threads = threads.max(1);
        let (job_tx, job_rx) = sync_channel::<Job>(threads);
        let (slot_tx, slot_rx) = sync_channel::<Receiver<BlockResult>>(threads + 2);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let job_rx = Arc::clone(&job_rx);
            workers.push(std::thread::spawn(move || loop {
                let job = { job_rx.lock().expect("gzip job lock").recv() };
                match job {
                    Ok((block, result_tx)) => {
                        let _ = result_tx.send(deflate_block(level, &block, false));
                    }
                    Err(_) => break,
                }
            }));
        }

        let consumer = std::thread::spawn(move || -> io::Result<W> {
            for slot in slot_rx {
                let block = slot
                    .recv()
                    .map_err(|_| io::Error::other("gzip compressor worker died"))??;
                out.write_all(&block)?;
            }
            Ok(out)
        });

        Ok(Self {
            jobs: Some(job_tx),
            slots: Some(slot_tx),
            workers,
            consumer: Some(consumer),
            crc: Crc::new(),
            buf: Vec::with_capacity(BLOCK_SIZE),
            level,
        })
    }

    fn submit(&mut self, block: Vec<u8>) -> io::Result<()> {
        let stalled = || io::Error::other("gzip writer thread stopped");
        let (result_tx, result_rx) = sync_channel(1);
        self.slots
            .as_ref()
            .expect("slots open")
            .send(result_rx)
            .map_err(|_| stalled())?;
        self.jobs
            .as_ref()
            .expect("jobs open")
            .send((block, result_tx))
            .map_err(|_| stalled())?;
        Ok(())
    }

    pub(crate) fn finish(mut self) -> io::Result<W> {
        let tail = std::mem::take(&mut self.buf);
        if !tail.is_empty() {
            self.submit(tail)?;
        }
        drop(self.jobs.take());
        drop(self.slots.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        let mut out = self
            .consumer
            .take()
            .expect("consumer running")
            .join()
            .map_err(|_| io::Error::other("gzip writer thread panicked"))??;

        out.write_all(&deflate_block(self.level, &[], true)?)?;
        out.write_all(&self.crc.sum().to_le_bytes())?;
        out.write_all(&self.crc.amount().to_le_bytes())?;
        out.flush()?;
        Ok(out)
    }
}

impl<W: Write + Send + 'static> Write for ParallelGzWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.crc.update(data);
        self.buf.extend_from_slice(data);
        while self.buf.len() >= BLOCK_SIZE {
            let rest = self.buf.split_off(BLOCK_SIZE);
            let block = std::mem::replace(&mut self.buf, rest);
            self.submit(block)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Blocks in flight land in order at finish(); nothing to do here.
        Ok(())
    }
}

impl<W: Write + Send + 'static> Drop for ParallelGzWriter<W> {
    fn drop(&mut self) {
        drop(self.jobs.take());
        drop(self.slots.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.join();
        }
    }
}

/// Raw-deflate `data` as one unit: full flush for interior blocks, FINISH for
/// the terminating one.
fn deflate_block(level: u32, data: &[u8], finishing: bool) -> io::Result<Vec<u8>> {
    let flush = if finishing {
        FlushCompress::Finish
    } else {
        FlushCompress::Full
    };
    let mut compress = Compress::new(Compression::new(level), false);
    let mut out = Vec::with_capacity(data.len() / 2 + 128);
    loop {
        if out.capacity() == out.len() {
            out.reserve(32 * 1024);
        }
        let written_before = compress.total_out();
        let consumed_before = compress.total_in() as usize;
        let status = compress
            .compress_vec(&data[consumed_before..], &mut out, flush)
            .map_err(io::Error::other)?;
        let wrote = compress.total_out() - written_before;
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if !finishing && compress.total_in() as usize == data.len() && wrote == 0 {
                    break;
                }
            }
        }
    }
    Ok(out)
}
