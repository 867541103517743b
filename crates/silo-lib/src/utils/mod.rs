pub mod fs;
pub mod jsonc;
pub mod version;
