pub use anyhow::bail;
pub use anyhow::Context;

pub type Void = anyhow::Result<()>;
pub type Res<T> = anyhow::Result<T>;
