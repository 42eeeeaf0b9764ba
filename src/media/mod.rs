pub mod tone;
pub mod wav;
