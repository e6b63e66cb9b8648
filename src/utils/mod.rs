pub mod path_utils;
pub mod patterns;
pub mod text;
