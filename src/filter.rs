/// Coarse content filter: a post is dropped from search results when its
/// text contains any banned word as a literal, case-sensitive substring.
#[derive(Debug, Clone, Default)]
pub struct ContentFilter {
    banned: Vec<String>,
}

impl ContentFilter {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        // An empty pattern would match every text
        let banned = words.into_iter().map(Into::into).filter(|w: &String| !w.is_empty()).collect();
        Self { banned }
    }

    pub fn is_filtered(&self, text: &str) -> bool {
        self.banned.iter().any(|word| text.contains(word.as_str()))
    }

    pub fn words(&self) -> &[String] {
        &self.banned
    }
}
