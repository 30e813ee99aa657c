use crate::error::{EngineError, Result};
use stagewise_abstraction::{DataSource, Mode};

/// The train/val/test data sources of a run.
///
/// An unset val source falls back to the test source and vice versa. When
/// neither is set, both fall back to the train source.
#[derive(Default)]
pub struct DataSources {
    slots: Vec<Option<Box<dyn DataSource>>>,
    train: Option<usize>,
    val: Option<usize>,
    test: Option<usize>,
}

impl std::fmt::Debug for DataSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSources")
            .field("train", &self.train)
            .field("val", &self.slot_for(Mode::Val))
            .field("test", &self.slot_for(Mode::Test))
            .finish_non_exhaustive()
    }
}

impl DataSources {
    pub fn new(
        train: Option<Box<dyn DataSource>>,
        val: Option<Box<dyn DataSource>>,
        test: Option<Box<dyn DataSource>>,
    ) -> Self {
        let mut sources = Self::default();
        sources.train = sources.push(train);
        sources.val = sources.push(val);
        sources.test = sources.push(test);
        sources
    }

    fn push(&mut self, source: Option<Box<dyn DataSource>>) -> Option<usize> {
        let source = source?;
        self.slots.push(Some(source));
        Some(self.slots.len() - 1)
    }

    fn slot_for(&self, mode: Mode) -> Option<usize> {
        match mode {
            Mode::Train => self.train,
            Mode::Val => self.val.or(self.test).or(self.train),
            Mode::Test => self.test.or(self.val).or(self.train),
        }
    }

    /// Whether a source is available for `mode`, after fallbacks.
    pub fn has(&self, mode: Mode) -> bool {
        self.slot_for(mode).is_some()
    }

    pub fn get(&self, mode: Mode) -> Option<&dyn DataSource> {
        self.slot_for(mode).and_then(|i| self.slots[i].as_deref())
    }

    /// Batches per epoch of the source for `mode`, 0 if there is none.
    pub fn len(&self, mode: Mode) -> usize {
        self.get(mode).map_or(0, DataSource::len)
    }

    /// Borrow the source for `mode` out of its slot for one epoch.
    ///
    /// The caller must hand it back through `restore`.
    pub(crate) fn take(&mut self, mode: Mode) -> Result<(usize, Box<dyn DataSource>)> {
        let missing = || EngineError::MissingDataSource(mode.as_str().to_string());
        let slot = self.slot_for(mode).ok_or_else(missing)?;
        let source = self.slots[slot].take().ok_or_else(missing)?;
        Ok((slot, source))
    }

    pub(crate) fn restore(&mut self, slot: usize, source: Box<dyn DataSource>) {
        self.slots[slot] = Some(source);
    }
}
