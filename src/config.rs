use anyhow::{bail, Context, Result};

/// Parsed mount options, recognized out of a comma-separated `-o` option string (`name=value`
/// or bare-name forms). Anything not recognized here is forwarded to the kernel bridge
/// unchanged as a raw FUSE mount option.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
	pub foreground: bool,
	pub debug: bool,
	pub allow_other: bool,
	pub async_read: bool,
	pub cache_size: Option<usize>,
	pub extra: Vec<String>,
}

impl MountOptions {
	pub fn parse(raw: &str) -> Result<Self> {
		let mut options = Self::default();

		for item in raw.split(',') {
			let item = item.trim();
			if item.is_empty() {
				continue;
			}

			match item.split_once('=') {
				Some(("cachesize", value)) => {
					let size: usize = value
						.parse()
						.with_context(|| format!("invalid cachesize value '{}'", value))?;
					if size < 1 {
						bail!("cachesize must be >= 1");
					}
					options.cache_size = Some(size);
				}
				Some((name, value)) => {
					options.extra.push(format!("{}={}", name, value));
				}
				None => match item {
					"foreground" => options.foreground = true,
					"debug" => options.debug = true,
					"allowother" => options.allow_other = true,
					"async" => options.async_read = true,
					other => options.extra.push(other.to_string()),
				},
			}
		}

		Ok(options)
	}
}
