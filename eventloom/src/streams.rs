//! Channel combinators shared across the crate.
//!
//! Streams are `tokio::sync::mpsc` channel pairs: a value channel and an
//! error channel that both close when the producer finishes. All helpers
//! honor consumer cancellation: when the returned receiver is dropped, the
//! forwarding task observes the closed channel and stops.

use std::ops::ControlFlow;

use tokio::sync::mpsc;

/// Capacity of every stream channel in the crate. Producers block on a full
/// channel until the consumer catches up.
pub const CHANNEL_CAPACITY: usize = 256;

/// Collects a stream until it closes, failing fast on the first error.
pub async fn drain<T, E>(
    mut values: mpsc::Receiver<T>,
    mut errors: mpsc::Receiver<E>,
) -> Result<Vec<T>, E> {
    let mut collected = Vec::new();
    let mut errors_open = true;
    loop {
        if errors_open {
            tokio::select! {
                maybe_value = values.recv() => match maybe_value {
                    Some(value) => collected.push(value),
                    None => return Ok(collected),
                },
                maybe_error = errors.recv() => match maybe_error {
                    Some(err) => return Err(err),
                    None => errors_open = false,
                },
            }
        } else {
            match values.recv().await {
                Some(value) => collected.push(value),
                None => return Ok(collected),
            }
        }
    }
}

/// Visits a stream item by item until it closes, the visitor breaks, or an
/// error arrives.
pub async fn walk<T, E, F>(
    mut values: mpsc::Receiver<T>,
    mut errors: mpsc::Receiver<E>,
    mut visit: F,
) -> Result<(), E>
where
    F: FnMut(T) -> ControlFlow<()>,
{
    let mut errors_open = true;
    loop {
        if errors_open {
            tokio::select! {
                maybe_value = values.recv() => match maybe_value {
                    Some(value) => {
                        if visit(value).is_break() {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },
                maybe_error = errors.recv() => match maybe_error {
                    Some(err) => return Err(err),
                    None => errors_open = false,
                },
            }
        } else {
            match values.recv().await {
                Some(value) => {
                    if visit(value).is_break() {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }
}

/// Forwards only the items satisfying `predicate`.
pub fn filter<T, F>(mut input: mpsc::Receiver<T>, predicate: F) -> mpsc::Receiver<T>
where
    T: Send + 'static,
    F: Fn(&T) -> bool + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(item) = input.recv().await {
            if predicate(&item) && tx.send(item).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Inserts the interceptor's extra items immediately before each item.
pub fn before_each<T, F>(mut input: mpsc::Receiver<T>, mut intercept: F) -> mpsc::Receiver<T>
where
    T: Send + 'static,
    F: FnMut(&T) -> Vec<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        'outer: while let Some(item) = input.recv().await {
            for extra in intercept(&item) {
                if tx.send(extra).await.is_err() {
                    break 'outer;
                }
            }
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Merges several streams into one. The output closes when every input has
/// closed.
pub fn fan_in<T>(inputs: Vec<mpsc::Receiver<T>>) -> mpsc::Receiver<T>
where
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    for mut input in inputs {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(item) = input.recv().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
    }
    rx
}

/// Streams an owned collection.
pub fn replay<T>(items: Vec<T>) -> mpsc::Receiver<T>
where
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        for item in items {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_errors() -> mpsc::Receiver<&'static str> {
        let (_tx, rx) = mpsc::channel(1);
        rx
    }

    #[tokio::test]
    async fn drain_collects_until_close() {
        let values = replay(vec![1, 2, 3]);
        let collected = drain(values, closed_errors()).await.unwrap();
        assert_eq!(collected, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn drain_fails_fast_on_error() {
        let (tx, values) = mpsc::channel::<u32>(1);
        let (err_tx, errors) = mpsc::channel(1);
        err_tx.send("boom").await.unwrap();
        drop(err_tx);
        let result = drain(values, errors).await;
        assert_eq!(result.unwrap_err(), "boom");
        drop(tx);
    }

    #[tokio::test]
    async fn walk_stops_on_break() {
        let values = replay(vec![1, 2, 3, 4]);
        let mut seen = Vec::new();
        walk(values, closed_errors(), |v| {
            seen.push(v);
            if v == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await
        .unwrap();
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn filter_drops_non_matching_items() {
        let even = filter(replay(vec![1, 2, 3, 4]), |v| v % 2 == 0);
        let collected = drain(even, closed_errors()).await.unwrap();
        assert_eq!(collected, vec![2, 4]);
    }

    #[tokio::test]
    async fn before_each_inserts_extras_in_order() {
        let out = before_each(replay(vec![10, 20]), |v| vec![v - 2, v - 1]);
        let collected = drain(out, closed_errors()).await.unwrap();
        assert_eq!(collected, vec![8, 9, 10, 18, 19, 20]);
    }

    #[tokio::test]
    async fn fan_in_merges_and_closes() {
        let merged = fan_in(vec![replay(vec![1, 2]), replay(vec![3])]);
        let mut collected = drain(merged, closed_errors()).await.unwrap();
        collected.sort_unstable();
        assert_eq!(collected, vec![1, 2, 3]);
    }
}
