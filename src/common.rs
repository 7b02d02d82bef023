pub use anyhow::{bail, ensure, format_err, Context, Error, Result as Fallible};
pub use argh::FromArgs;
pub use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbImage};
pub use itertools::Itertools;
pub use log::{debug, error, info, warn};
pub use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
pub use rayon::prelude::*;
pub use serde::{
    de::Error as DeserializeError, Deserialize, Deserializer, Serialize, Serializer,
};
pub use std::{
    borrow::Borrow,
    fs::{self, File, OpenOptions},
    io::{prelude::*, BufReader, BufWriter},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};
pub use tch::{
    nn::{self, OptimizerConfig, VarStore},
    Device, Kind, Reduction, Tensor,
};
pub use tch_tensor_like::TensorLike;
