use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use tokio::sync::Notify;

use crate::chat::GuildId;

/// The partition was at capacity; the item was not enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull {
    pub guild_id: GuildId,
}

impl std::fmt::Display for QueueFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue full for guild {}", self.guild_id)
    }
}

impl std::error::Error for QueueFull {}

struct Partition<T> {
    items: VecDeque<T>,
    priority: i32,
    /// Service stamp of the last `get` that drew from this partition; 0
    /// means never served, which sorts as oldest.
    last_served: u64,
}

struct RoutingTable<T> {
    partitions: HashMap<GuildId, Partition<T>>,
    priorities: HashMap<GuildId, i32>,
    served_counter: u64,
}

/// A queue partitioned by guild with a fair selection policy.
///
/// `put` is synchronous and bounded per partition. `get` serves the
/// highest-priority class first and, within a class, the partition served
/// longest ago, which degenerates to strict round-robin when priorities
/// are equal. One slow guild therefore delays any other guild by at most
/// one service slot. Empty partitions are dropped from the routing table
/// so the priority map does not leak memory across guild churn.
///
/// `get` is cancel-safe; loops race it against the shutdown signal.
pub struct DistributedQueue<T> {
    inner: Arc<Mutex<RoutingTable<T>>>,
    notify: Arc<Notify>,
    per_partition_capacity: usize,
}

impl<T> Clone for DistributedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            notify: Arc::clone(&self.notify),
            per_partition_capacity: self.per_partition_capacity,
        }
    }
}

impl<T> DistributedQueue<T> {
    pub fn new(per_partition_capacity: usize, priorities: HashMap<GuildId, i32>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RoutingTable {
                partitions: HashMap::new(),
                priorities,
                served_counter: 0,
            })),
            notify: Arc::new(Notify::new()),
            per_partition_capacity,
        }
    }

    pub fn put(&self, guild_id: GuildId, item: T) -> Result<(), QueueFull> {
        {
            let mut table = self.inner.lock().expect("queue lock poisoned");
            let priority = table.priorities.get(&guild_id).copied().unwrap_or(0);
            let partition = table
                .partitions
                .entry(guild_id)
                .or_insert_with(|| Partition {
                    items: VecDeque::new(),
                    priority,
                    last_served: 0,
                });

            if partition.items.len() >= self.per_partition_capacity {
                return Err(QueueFull { guild_id });
            }
            partition.items.push_back(item);
        }

        self.notify.notify_waiters();
        Ok(())
    }

    /// Waits until any partition has an item and returns it according to
    /// the fairness policy.
    pub async fn get(&self) -> (GuildId, T) {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<(GuildId, T)> {
        let mut table = self.inner.lock().expect("queue lock poisoned");

        let best = table
            .partitions
            .iter()
            .filter(|(_, p)| !p.items.is_empty())
            .max_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    // lower last_served = served longer ago = preferred
                    .then(b.last_served.cmp(&a.last_served))
            })
            .map(|(guild_id, _)| *guild_id)?;

        table.served_counter += 1;
        let stamp = table.served_counter;

        let partition = table.partitions.get_mut(&best).expect("selected partition");
        let item = partition.items.pop_front().expect("non-empty partition");
        partition.last_served = stamp;

        if partition.items.is_empty() {
            table.partitions.remove(&best);
        }

        Some((best, item))
    }

    pub fn size(&self, guild_id: GuildId) -> usize {
        let table = self.inner.lock().expect("queue lock poisoned");
        table
            .partitions
            .get(&guild_id)
            .map(|p| p.items.len())
            .unwrap_or(0)
    }

    pub fn total_size(&self) -> usize {
        let table = self.inner.lock().expect("queue lock poisoned");
        table.partitions.values().map(|p| p.items.len()).sum()
    }

    /// Empties the whole queue; used on shutdown so undeliverable items
    /// can be marked discarded.
    pub fn drain_all(&self) -> Vec<(GuildId, T)> {
        let mut table = self.inner.lock().expect("queue lock poisoned");
        let mut drained = Vec::new();
        for (guild_id, partition) in table.partitions.drain() {
            for item in partition.items {
                drained.push((guild_id, item));
            }
        }
        drained
    }
}
