use std::sync::{Arc, PoisonError, RwLock};

/// Process-wide state shared between the engine and its background tasks.
///
/// A panicking writer never locks readers out: the value behind a poisoned
/// lock is still handed out.
pub struct State<T> {
    state: Arc<RwLock<T>>,
}

impl<T> State<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn read<F, K>(&self, f: F) -> K
    where
        F: FnOnce(&T) -> K,
    {
        let value = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&value)
    }

    pub fn write<F, K>(&self, f: F) -> K
    where
        F: FnOnce(&mut T) -> K,
    {
        let mut value = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut value)
    }
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Default> Default for State<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn it_shares_writes_between_clones() {
        let state = State::new(0u32);
        let other = state.clone();
        other.write(|n| *n += 2);
        assert_eq!(state.read(|n| *n), 2);
    }

    #[test]
    fn it_survives_a_panicking_writer() {
        let state = State::new(vec![1]);
        let other = state.clone();
        let _ = thread::spawn(move || {
            other.write(|v| {
                v.push(2);
                panic!("boom");
            })
        })
        .join();
        assert_eq!(state.read(Vec::len), 2);
    }
}
