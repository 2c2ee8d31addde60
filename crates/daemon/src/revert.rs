//! # Init Reverter
//!
//! Scoped rollback for the startup path: register an undo action after
//! each successful step, call [`Reverter::disarm`] once everything is
//! up, and run [`Reverter::revert`] (newest first) on any early
//! return. A failure anywhere in init leaves the state directory as it
//! was before `run`, modulo the one-time creation of the directory
//! itself.

use futures::future::BoxFuture;

type Action = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
pub(crate) struct Reverter {
    actions: Vec<Action>,
    disarmed: bool,
}

impl Reverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an undo action for a step that just succeeded.
    pub fn add<F, Fut>(&mut self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.actions.push(Box::new(move || Box::pin(action())));
    }

    /// Marks init as successful; a later `revert` does nothing.
    pub fn disarm(&mut self) {
        self.disarmed = true;
        self.actions.clear();
    }

    /// Runs the registered undo actions, newest first.
    pub async fn revert(&mut self) {
        if self.disarmed {
            return;
        }

        while let Some(action) = self.actions.pop() {
            action().await;
        }
    }
}
