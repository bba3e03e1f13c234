use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;

pub fn strip_ansi_escapes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut in_escape = false;
    for c in s.chars() {
        if c == '\x1b' {
            in_escape = true;
        } else if in_escape {
            if c.is_ascii_alphabetic() {
                in_escape = false;
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Log file capped at roughly `max_lines` lines.
///
/// The file stays open for appending and the writer keeps a running line
/// count, so the file is only re-read when the count passes `max_lines` plus
/// some slack. Pruning writes the newest `max_lines` lines to a sibling
/// temp file and renames it over the log.
#[derive(Clone)]
pub(crate) struct CircularFileWriter {
    path: PathBuf,
    max_lines: usize,
    state: Arc<Mutex<WriterState>>,
}

struct WriterState {
    file: Option<File>,
    lines: usize,
}

impl CircularFileWriter {
    pub fn new(path: impl Into<PathBuf>, max_lines: u32) -> Self {
        let path = path.into();
        let lines = count_lines(&path).unwrap_or(0);
        Self {
            path,
            max_lines: max_lines.max(1) as usize,
            state: Arc::new(Mutex::new(WriterState { file: None, lines })),
        }
    }

    /// Lines allowed past `max_lines` before a prune: 10%, at least 50.
    fn slack(&self) -> usize {
        (self.max_lines / 10).max(50)
    }

    fn open_append(&self) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(&self.path)
    }

    fn prune(&self, state: &mut WriterState) -> io::Result<()> {
        state.file = None;

        let reader = BufReader::new(File::open(&self.path)?);
        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
        let keep = &lines[lines.len().saturating_sub(self.max_lines)..];

        let tmp = self.path.with_extension("prune");
        {
            let mut out = io::BufWriter::new(File::create(&tmp)?);
            for line in keep {
                writeln!(out, "{}", line)?;
            }
            out.flush()?;
        }
        fs::rename(&tmp, &self.path)?;

        state.lines = keep.len();
        Ok(())
    }
}

fn count_lines(path: &Path) -> io::Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    Ok(reader.lines().count())
}

impl io::Write for CircularFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();

        if state.file.is_none() {
            state.file = Some(self.open_append()?);
        }
        if let Some(file) = state.file.as_mut() {
            file.write_all(buf)?;
        }
        state.lines += buf.iter().filter(|&&b| b == b'\n').count();

        if state.lines > self.max_lines + self.slack() {
            if let Err(e) = self.prune(&mut state) {
                eprintln!("Failed to prune log file {}: {}", self.path.display(), e);
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.state.lock().file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CircularFileWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
