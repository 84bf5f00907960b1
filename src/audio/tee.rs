//! Splits a demodulated PCM stream between a downstream consumer (the
//! decoder's stdin) and an optional in-progress recording.

use super::recorder::Recorder;
use std::io::{Read, Write};
use std::sync::Arc;

const CHUNK_SIZE: usize = 8192;

pub struct AudioTee<R, W> {
    src: R,
    dst: W,
    recorder: Option<Arc<Recorder>>,
}

impl<R: Read, W: Write> AudioTee<R, W> {
    pub fn new(src: R, dst: W, recorder: Option<Arc<Recorder>>) -> Self {
        AudioTee { src, dst, recorder }
    }

    /// Thread body: reads fixed-size chunks until EOF, writing each to the
    /// downstream sink and, if a capture is active, to the recorder. Stops
    /// (does not error the process) on a broken pipe.
    pub fn run(&mut self) {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match self.src.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            if let Err(e) = self.dst.write_all(&buf[..n]) {
                if matches!(e.kind(), std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset) {
                    break;
                }
                break;
            }
            let _ = self.dst.flush();
            if let Some(rec) = &self.recorder {
                if rec.is_recording() {
                    rec.feed(&buf[..n]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::collections::HashMap;
    use std::io::Cursor;

    fn test_config() -> Config {
        Config::from_env(&HashMap::<&str, &str>::new()).unwrap()
    }

    #[test]
    fn tees_every_byte_to_downstream() {
        let src = Cursor::new(vec![1u8, 2, 3, 4, 5]);
        let mut dst = Vec::new();
        {
            let mut tee = AudioTee::new(src, &mut dst, None::<Arc<Recorder>>);
            tee.run();
        }
        assert_eq!(dst, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn feeds_recorder_only_while_recording() {
        let cfg = test_config();
        let recorder = Arc::new(Recorder::new(cfg));
        let src = Cursor::new(vec![9u8; 16]);
        let dst = Vec::new();
        let mut tee = AudioTee::new(src, dst, Some(recorder.clone()));
        tee.run();
        assert_eq!(recorder.buffered_len(), 0);
    }
}
