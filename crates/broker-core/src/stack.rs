//! Mutex-guarded LIFO stack shared by the notification queue and the
//! pending-message buffer.

use std::sync::Mutex;

#[derive(Debug)]
pub(crate) struct ConcurrentStack<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Default for ConcurrentStack<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<T> ConcurrentStack<T> {
    pub(crate) fn push(&self, item: T) {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).push(item);
    }

    /// Take every item, most recent first, leaving the stack empty.
    ///
    /// The swap happens under the lock, so an item is handed to exactly one
    /// caller even when several drain concurrently.
    pub(crate) fn drain(&self) -> Vec<T> {
        let mut items = std::mem::take(&mut *self.items.lock().unwrap_or_else(|e| e.into_inner()));
        items.reverse();
        items
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_drain_is_lifo_and_empties() {
        let stack = ConcurrentStack::default();
        stack.push(1);
        stack.push(2);
        stack.push(3);
        assert_eq!(stack.drain(), vec![3, 2, 1]);
        assert_eq!(stack.len(), 0);
        assert!(stack.drain().is_empty());
    }

    #[test]
    fn test_concurrent_push_and_drain_loses_nothing() {
        let stack = Arc::new(ConcurrentStack::default());
        let drained = Arc::new(Mutex::new(Vec::new()));

        let pushers: Vec<_> = (0..4)
            .map(|t| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    for i in 0..250 {
                        stack.push(t * 1000 + i);
                    }
                })
            })
            .collect();
        let drainers: Vec<_> = (0..2)
            .map(|_| {
                let stack = Arc::clone(&stack);
                let drained = Arc::clone(&drained);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let batch = stack.drain();
                        drained.lock().unwrap().extend(batch);
                    }
                })
            })
            .collect();

        for handle in pushers.into_iter().chain(drainers) {
            handle.join().unwrap();
        }
        drained.lock().unwrap().extend(stack.drain());

        let mut all = drained.lock().unwrap().clone();
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(before, all.len(), "an item was drained twice");
        assert_eq!(all.len(), 1000);
    }
}
