use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use loopback_capture_core::{DeliverySink, PcmFrame};

/// Lines buffered between the capture thread and the writer thread.
const LINE_QUEUE_CAPACITY: usize = 256;

/// One stdout line per delivered frame; the harness parses exactly this shape.
pub fn format_pcm_line(frame: &PcmFrame) -> String {
    format!(
        "Received PCM data: {} bytes, {}Hz, {} channels, {} bits",
        frame.len(),
        frame.format.sample_rate,
        frame.format.channels,
        frame.format.bits_per_sample
    )
}

enum Line {
    Out(String),
    Err(String),
    Flush(Sender<()>),
}

/// Sink that reports frame metadata on stdout and errors on stderr.
///
/// Delivery only formats the line and queues it; a `line-writer` thread does
/// the I/O. When the queue is full (reader stopped draining the pipe) lines
/// are dropped and counted instead of stalling the capture thread.
pub struct LineProtocolSink {
    lines: Sender<Line>,
    dropped: AtomicU64,
}

impl LineProtocolSink {
    pub fn stdio() -> io::Result<Self> {
        Self::new(Box::new(io::stdout()), Box::new(io::stderr()))
    }

    pub fn new(out: Box<dyn Write + Send>, err: Box<dyn Write + Send>) -> io::Result<Self> {
        Self::with_capacity(out, err, LINE_QUEUE_CAPACITY)
    }

    pub fn with_capacity(
        out: Box<dyn Write + Send>,
        err: Box<dyn Write + Send>,
        capacity: usize,
    ) -> io::Result<Self> {
        let (lines, queue) = crossbeam_channel::bounded(capacity);
        thread::Builder::new()
            .name("line-writer".into())
            .spawn(move || write_lines(queue, out, err))?;
        Ok(Self {
            lines,
            dropped: AtomicU64::new(0),
        })
    }

    /// Wait until every line queued so far has been written.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (done, flushed) = crossbeam_channel::bounded(1);
        if self.lines.send_timeout(Line::Flush(done), timeout).is_err() {
            return false;
        }
        flushed.recv_timeout(timeout).is_ok()
    }

    /// Lines discarded because the writer fell behind.
    pub fn dropped_lines(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn enqueue(&self, line: Line) {
        match self.lines.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("Output queue full, {} lines dropped so far", dropped);
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("Line writer has exited");
            }
        }
    }
}

fn write_lines(queue: Receiver<Line>, mut out: Box<dyn Write + Send>, mut err: Box<dyn Write + Send>) {
    for line in queue {
        let (writer, text) = match line {
            Line::Out(text) => (&mut out, text),
            Line::Err(text) => (&mut err, text),
            Line::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };
        // A closed pipe must not end the process.
        if writeln!(writer, "{}", text).and_then(|_| writer.flush()).is_err() {
            log::debug!("Dropped output line: {}", text);
        }
    }
}

impl DeliverySink for LineProtocolSink {
    fn on_pcm_data(&self, frame: &PcmFrame) {
        self.enqueue(Line::Out(format_pcm_line(frame)));
    }

    fn on_error(&self, message: &str) {
        self.enqueue(Line::Err(format!("Audio capture error: {}", message)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    use parking_lot::Mutex;

    use loopback_capture_core::PcmFormat;

    /// In-memory writer whose contents can be read back after being boxed.
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Writer whose every write takes two seconds, like a pipe nobody reads.
    struct StalledWriter;

    impl Write for StalledWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_secs(2));
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn reference_frame() -> PcmFrame {
        PcmFrame {
            bytes: vec![0; 4096],
            format: PcmFormat::REFERENCE,
        }
    }

    #[test]
    fn formats_reference_frame() {
        let frame = PcmFrame {
            bytes: vec![0; 4096],
            format: PcmFormat::REFERENCE,
        };
        assert_eq!(
            format_pcm_line(&frame),
            "Received PCM data: 4096 bytes, 48000Hz, 2 channels, 16 bits"
        );
    }

    #[test]
    fn errors_go_to_stderr_writer() {
        let out = SharedBuffer::default();
        let err = SharedBuffer::default();
        let sink = LineProtocolSink::new(Box::new(out.clone()), Box::new(err.clone())).unwrap();

        sink.on_error("Stream stopped with error: device removed");

        assert!(sink.flush(TIMEOUT));
        assert!(out.contents().is_empty());
        assert_eq!(
            err.contents(),
            "Audio capture error: Stream stopped with error: device removed\n"
        );
    }

    #[test]
    fn frames_are_written_in_order() {
        let out = SharedBuffer::default();
        let sink = LineProtocolSink::new(Box::new(out.clone()), Box::new(io::sink())).unwrap();

        sink.on_pcm_data(&reference_frame());
        sink.on_pcm_data(&PcmFrame {
            bytes: vec![0; 512],
            format: PcmFormat::REFERENCE,
        });

        assert!(sink.flush(TIMEOUT));
        assert_eq!(
            out.contents(),
            "Received PCM data: 4096 bytes, 48000Hz, 2 channels, 16 bits\n\
             Received PCM data: 512 bytes, 48000Hz, 2 channels, 16 bits\n"
        );
        assert_eq!(sink.dropped_lines(), 0);
    }

    #[test]
    fn stalled_output_does_not_block_delivery() {
        let sink =
            LineProtocolSink::with_capacity(Box::new(StalledWriter), Box::new(StalledWriter), 2)
                .unwrap();

        let started = Instant::now();
        for _ in 0..10 {
            sink.on_pcm_data(&reference_frame());
        }
        sink.on_error("device removed");

        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(sink.dropped_lines() > 0);
    }
}
