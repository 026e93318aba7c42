pub struct Semaphore {
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            sem: tokio::sync::Semaphore::new(initial),
        }
    }

    pub async fn consume(&self) {
        match self.sem.acquire().await {
            Ok(permit) => permit.forget(),
            // closed semaphore means nobody replenishes anymore, let the caller through
            Err(_) => tracing::debug!("throttle semaphore closed"),
        }
    }

    /// Tops the bucket up to `replenish` tokens, never above.
    pub fn replenish(&self, replenish: usize) {
        let curr_permits = self.sem.available_permits();
        if curr_permits >= replenish {
            return;
        }
        self.sem.add_permits(replenish - curr_permits);
    }
}
