//! Thread objects.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::handles::{ProcessId, ThreadId};
use crate::ipc::{Pipe, StreamOptions, PIPE_DEFAULT_CAPACITY};
use crate::mstring::MString;

pub(super) struct ThreadState {
    pub name: MString,
    pub exit_code: i32,
    pub finished: bool,
}

/// Registry entry for one thread. The parent process id never changes for
/// the thread's lifetime; cross-process operations check it.
pub(super) struct ThreadEntry {
    pub id: ThreadId,
    pub process: ProcessId,
    /// Built-in pipe, addressed with port -1.
    pub pipe: Pipe,
    pub state: Mutex<ThreadState>,
    pub lifecycle: Condvar,
    pub signals: Mutex<VecDeque<i32>>,
}

impl ThreadEntry {
    pub(super) fn new(id: ThreadId, process: ProcessId, name: MString) -> Self {
        ThreadEntry {
            id,
            process,
            pipe: Pipe::new(process, -1, PIPE_DEFAULT_CAPACITY, StreamOptions::empty()),
            state: Mutex::new(ThreadState {
                name,
                exit_code: 0,
                finished: false,
            }),
            lifecycle: Condvar::new(),
            signals: Mutex::new(VecDeque::new()),
        }
    }

    pub(super) fn finish(&self, code: i32) {
        let mut state = self.state.lock().unwrap();
        if !state.finished {
            state.finished = true;
            state.exit_code = code;
        }
        self.lifecycle.notify_all();
    }

    pub(super) fn is_finished(&self) -> bool {
        self.state.lock().unwrap().finished
    }
}
