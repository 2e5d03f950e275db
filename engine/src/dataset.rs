use std::sync::Arc;

use crate::Tensor;

/// A single element of a dataset, one tensor per component.
pub type Element = Vec<Tensor>;

type ElementIter = Box<dyn Iterator<Item = Element> + Send>;
type Source = Arc<dyn Fn() -> ElementIter + Send + Sync>;

/// A re-iterable description of a data source.
///
/// Every call to `iter` starts a fresh pass over the data, which is what an
/// iterator initializer does each time it runs.
#[derive(Clone)]
pub struct Dataset {
    source: Source,
}

impl Dataset {
    /// Creates a new `Dataset` from a function producing fresh passes over the data.
    ///
    /// # Arguments
    /// * `source` - Called once per pass.
    pub fn new<F, I>(source: F) -> Self
    where
        F: Fn() -> I + Send + Sync + 'static,
        I: Iterator<Item = Element> + Send + 'static,
    {
        Self {
            source: Arc::new(move || Box::new(source()) as ElementIter),
        }
    }

    /// A finite dataset over the given elements.
    pub fn from_elements(elements: Vec<Element>) -> Self {
        let elements = Arc::new(elements);
        Self::new(move || {
            let elements = elements.clone();
            (0..elements.len()).map(move |i| elements[i].clone())
        })
    }

    /// A finite single-component dataset.
    pub fn from_tensors(tensors: Vec<Tensor>) -> Self {
        Self::from_elements(tensors.into_iter().map(|t| vec![t]).collect())
    }

    /// A dataset generated element by element, ends on the first `None`.
    ///
    /// # Arguments
    /// * `generator` - Maps the index of the element within the pass to the element.
    pub fn from_fn<F>(generator: F) -> Self
    where
        F: Fn(u64) -> Option<Element> + Send + Sync + 'static,
    {
        let generator = Arc::new(generator);
        Self::new(move || {
            let generator = generator.clone();
            (0u64..).map_while(move |i| generator(i))
        })
    }

    /// Repeats the dataset indefinitely. An empty dataset stays empty.
    pub fn repeat(self) -> Self {
        let source = self.source;
        Self::new(move || Repeat {
            source: source.clone(),
            current: source(),
            yielded: false,
        })
    }

    /// Keeps at most the first `n` elements of every pass.
    pub fn take(self, n: usize) -> Self {
        let source = self.source;
        Self::new(move || source().take(n))
    }

    /// Starts a new pass over the data.
    pub fn iter(&self) -> Box<dyn Iterator<Item = Element> + Send> {
        (self.source)()
    }
}

struct Repeat {
    source: Source,
    current: ElementIter,
    yielded: bool,
}

impl Iterator for Repeat {
    type Item = Element;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(element) = self.current.next() {
                self.yielded = true;
                return Some(element);
            }

            if !self.yielded {
                return None;
            }

            self.current = (self.source)();
            self.yielded = false;
        }
    }
}
