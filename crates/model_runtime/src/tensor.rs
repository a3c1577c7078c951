//! Тензоры с учётом памяти: каждая аллокация регистрируется в аллокаторе,
//! освобождение происходит ровно один раз — в `Drop`.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ndarray::{ArrayD, ArrayViewD, Axis};
use serde::Serialize;

/// Идентификатор буфера внутри аллокатора.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TensorId(pub u64);

/// Снимок учёта памяти (аналог `tf.memory()`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryInfo {
    /// Живые тензоры.
    pub num_tensors: usize,
    /// Байты в живых тензорах.
    pub num_bytes: usize,
    pub allocations: u64,
    pub releases: u64,
}

/// Учёт буферов. Рантайм вызывает `allocate` при создании тензора и `release` при его уничтожении.
pub trait TensorAllocator: Send + Sync {
    fn allocate(&self, shape: &[usize]) -> TensorId;

    fn release(&self, id: TensorId, shape: &[usize]);

    fn memory(&self) -> MemoryInfo;
}

/// Число элементов тензора формы `shape`. `None`, если произведение не помещается в `usize`.
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d))
}

pub(crate) fn byte_len(shape: &[usize]) -> usize {
    shape.iter().product::<usize>() * std::mem::size_of::<f32>()
}

/// Аллокатор по умолчанию: атомарные счётчики.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    next_id: AtomicU64,
    live_tensors: AtomicUsize,
    live_bytes: AtomicUsize,
    allocations: AtomicU64,
    releases: AtomicU64,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TensorAllocator for MemoryTracker {
    fn allocate(&self, shape: &[usize]) -> TensorId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live_tensors.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(byte_len(shape), Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        TensorId(id)
    }

    fn release(&self, _id: TensorId, shape: &[usize]) {
        self.live_tensors.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(byte_len(shape), Ordering::Relaxed);
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    fn memory(&self) -> MemoryInfo {
        MemoryInfo {
            num_tensors: self.live_tensors.load(Ordering::Relaxed),
            num_bytes: self.live_bytes.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }
}

/// Вложенное представление содержимого тензора (аналог `tensor.array()`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NestedValue {
    Scalar(f32),
    List(Vec<NestedValue>),
}

impl NestedValue {
    /// Плоский ряд чисел, если это список скаляров.
    pub fn as_row(&self) -> Option<Vec<f32>> {
        match self {
            NestedValue::List(items) => items
                .iter()
                .map(|v| match v {
                    NestedValue::Scalar(x) => Some(*x),
                    NestedValue::List(_) => None,
                })
                .collect(),
            NestedValue::Scalar(_) => None,
        }
    }

    /// Первая строка двумерной структуры. `None`, если структура не двумерная.
    pub fn first_row(&self) -> Option<Vec<f32>> {
        match self {
            NestedValue::List(rows) => rows.first().and_then(NestedValue::as_row),
            NestedValue::Scalar(_) => None,
        }
    }
}

fn nest(view: ArrayViewD<'_, f32>) -> NestedValue {
    if view.ndim() == 0 {
        return NestedValue::Scalar(view.iter().next().copied().unwrap_or_default());
    }
    NestedValue::List(view.axis_iter(Axis(0)).map(nest).collect())
}

/// Тензор, владеющий буфером. Освобождается в аллокаторе ровно один раз при drop.
pub struct OwnedTensor {
    id: TensorId,
    data: ArrayD<f32>,
    allocator: Arc<dyn TensorAllocator>,
}

impl OwnedTensor {
    pub(crate) fn new(data: ArrayD<f32>, allocator: Arc<dyn TensorAllocator>) -> Self {
        let id = allocator.allocate(data.shape());
        Self {
            id,
            data,
            allocator,
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn rank(&self) -> usize {
        self.data.ndim()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    pub fn to_nested(&self) -> NestedValue {
        nest(self.data.view())
    }

    /// Асинхронное чтение содержимого: точка приостановки перед копированием.
    pub async fn array(&self) -> NestedValue {
        tokio::task::yield_now().await;
        self.to_nested()
    }

    /// Явное освобождение; эквивалентно drop.
    pub fn dispose(self) {}
}

impl Drop for OwnedTensor {
    fn drop(&mut self) {
        self.allocator.release(self.id, self.data.shape());
    }
}

impl fmt::Debug for OwnedTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedTensor")
            .field("id", &self.id)
            .field("shape", &self.data.shape())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr0, arr1, arr2};

    #[test]
    fn test_drop_releases_once() {
        let tracker = Arc::new(MemoryTracker::new());
        let alloc: Arc<dyn TensorAllocator> = tracker.clone();
        let t = OwnedTensor::new(arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn(), Arc::clone(&alloc));
        assert_eq!(tracker.memory().num_tensors, 1);
        assert_eq!(tracker.memory().num_bytes, 16);
        t.dispose();
        let mem = tracker.memory();
        assert_eq!(mem.num_tensors, 0);
        assert_eq!(mem.num_bytes, 0);
        assert_eq!(mem.allocations, 1);
        assert_eq!(mem.releases, 1);
    }

    #[test]
    fn test_nested_first_row() {
        let tracker: Arc<dyn TensorAllocator> = Arc::new(MemoryTracker::new());
        let matrix = OwnedTensor::new(arr2(&[[0.5, 1.5], [2.0, 3.0]]).into_dyn(), Arc::clone(&tracker));
        assert_eq!(matrix.to_nested().first_row(), Some(vec![0.5, 1.5]));

        let vector = OwnedTensor::new(arr1(&[1.0, 2.0]).into_dyn(), Arc::clone(&tracker));
        assert_eq!(vector.to_nested().first_row(), None);

        let scalar = OwnedTensor::new(arr0(7.0).into_dyn(), tracker);
        assert_eq!(scalar.to_nested(), NestedValue::Scalar(7.0));
        assert_eq!(scalar.to_nested().first_row(), None);
    }
}
