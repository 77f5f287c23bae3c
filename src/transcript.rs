/// Транскрипт, накопленный на стороне ученика
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transcript {
    text: String,
    fragments: usize,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Фрагменты склеиваются как есть, разделители ставит отправитель
    pub fn push(&mut self, fragment: &str) {
        self.text.push_str(fragment);
        self.fragments += 1;
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.fragments = 0;
    }
}
