use serde::{Deserialize, Serialize};

/// JSON import/export for configuration and snapshot types.
pub trait Json<'a> {
    type Item;

    fn from_json(s: &'a str) -> serde_json::Result<Self::Item>
    where
        <Self as Json<'a>>::Item: Deserialize<'a>,
    {
        let b: Self::Item = serde_json::from_str(s)?;
        Ok(b)
    }

    fn to_json(&self) -> serde_json::Result<String>
    where
        Self: Serialize,
    {
        let s: String = serde_json::to_string(self)?;
        Ok(s)
    }
}

/// Install the test logger. Safe to call more than once.
pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}
