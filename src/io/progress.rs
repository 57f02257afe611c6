use std::sync::{Mutex, OnceLock};

type DownloadCallback = Box<dyn Fn(u64, u64) + Send + 'static>;
type SplitCallback = Box<dyn Fn(SplitProgress) + Send + 'static>;

static DOWNLOAD_PROGRESS_CB: OnceLock<Mutex<Option<DownloadCallback>>> = OnceLock::new();
static SPLIT_PROGRESS_CB: OnceLock<Mutex<Option<SplitCallback>>> = OnceLock::new();

#[derive(Debug, Clone, PartialEq)]
pub enum SplitProgress {
    /// Entering a pipeline stage: `resolve_toolchain`, `ingest`, `separate`, `mix`, `package`.
    Stage(&'static str),
    /// Model segments evaluated so far, across all shift passes.
    Chunks {
        done: usize,
        total: usize,
        percent: f32,
    },
    Finished,
}

pub fn set_download_progress_callback(cb: impl Fn(u64, u64) + Send + 'static) {
    let slot = DOWNLOAD_PROGRESS_CB.get_or_init(|| Mutex::new(None));
    if let Ok(mut g) = slot.lock() {
        *g = Some(Box::new(cb));
    }
}

pub fn set_split_progress_callback(cb: impl Fn(SplitProgress) + Send + 'static) {
    let slot = SPLIT_PROGRESS_CB.get_or_init(|| Mutex::new(None));
    if let Ok(mut g) = slot.lock() {
        *g = Some(Box::new(cb));
    }
}

pub fn emit_download_progress(done: u64, total: u64) {
    if let Some(m) = DOWNLOAD_PROGRESS_CB.get() {
        if let Ok(g) = m.lock() {
            if let Some(cb) = &*g {
                cb(done, total);
            }
        }
    }
}

pub fn emit_split_progress(p: SplitProgress) {
    if let Some(m) = SPLIT_PROGRESS_CB.get() {
        if let Ok(g) = m.lock() {
            if let Some(cb) = &*g {
                cb(p);
            }
        }
    }
}

pub(crate) fn emit_stage(stage: &'static str) {
    emit_split_progress(SplitProgress::Stage(stage));
}

pub(crate) fn emit_chunks(done: usize, total: usize) {
    let percent = if total == 0 {
        100.0
    } else {
        done as f32 / total as f32 * 100.0
    };
    emit_split_progress(SplitProgress::Chunks {
        done,
        total,
        percent,
    });
}
