//! Inference models over modelport adapters.
//!
//! A [`Model`] wraps any [`InferenceAdapter`](modelport_core::InferenceAdapter)
//! and turns images into typed results: top-k classes, SSD detections or
//! instance masks. Which variant is built comes from the `model_type`
//! metadata tag, or from [`ModelOptions::kind`].
//!
//! ```no_run
//! use modelport_models::Model;
//!
//! let mut model = Model::create_model("ssd.json")?;
//! let image = image::open("street.png").unwrap().to_rgb8();
//! for det in model.infer(&image)?.objects() {
//!     println!("{det}");
//! }
//! model.serialize("ssd_copy.json")?;
//! # Ok::<(), modelport_core::Error>(())
//! ```

mod backends;
mod model;
pub mod postprocess;
pub mod preprocess;
mod reload;
mod results;
pub mod rotated;
pub mod roundtrip;
pub mod utils;

pub use backends::load_adapter;
pub use model::{Model, ModelKind, ModelOptions, SharedAdapter};
pub use preprocess::OutputTransform;
pub use reload::ReloadedAdapter;
pub use results::{Classification, Detection, InferenceResult, Mask, SegmentedObject};
pub use rotated::{add_rotated_rects, RotatedRect, SegmentedObjectWithRects};
pub use roundtrip::{compare_results, verify_round_trip, RoundTripReport};
