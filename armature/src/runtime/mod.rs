mod bbone;
mod deform;
mod object;
mod parent;
mod pose;
mod solver;

pub use bbone::*;
pub use deform::*;
pub use object::*;
pub use parent::*;
pub use pose::*;
pub use solver::*;



#[cfg(test)]
mod bbone_tests;


#[cfg(test)]
mod object_tests;
