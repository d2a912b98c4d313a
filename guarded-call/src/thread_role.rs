//! Identity of the two threads most host callbacks run on.
//!
//! These checks are advisory, they are used to annotate diagnostics and are
//! not enforced anywhere.

use parking_lot::RwLock;
use std::{fmt, thread::ThreadId};

static GAME_THREAD: RwLock<Option<ThreadId>> = parking_lot::const_rwlock(None);
static RENDER_THREAD: RwLock<Option<ThreadId>> = parking_lot::const_rwlock(None);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadRole {
    Game,
    Render,
    Other,
}

impl fmt::Display for ThreadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Game => "game",
            Self::Render => "render",
            Self::Other => "other",
        })
    }
}

/// Marks the calling thread as the game thread
pub fn set_game_thread() {
    *GAME_THREAD.write() = Some(std::thread::current().id());
}

/// Marks the calling thread as the render thread
pub fn set_render_thread() {
    *RENDER_THREAD.write() = Some(std::thread::current().id());
}

#[inline]
pub fn is_game_thread() -> bool {
    *GAME_THREAD.read() == Some(std::thread::current().id())
}

#[inline]
pub fn is_render_thread() -> bool {
    *RENDER_THREAD.read() == Some(std::thread::current().id())
}

/// The role of the calling thread
pub fn current() -> ThreadRole {
    if is_game_thread() {
        ThreadRole::Game
    } else if is_render_thread() {
        ThreadRole::Render
    } else {
        ThreadRole::Other
    }
}
