/// Like `approx::assert_ulps_eq!`, but prints both sides with a `pretty_assertions` diff on failure
#[macro_export]
macro_rules! pretty_assert_ulps_eq {
  ($left:expr, $right:expr) => {{
    if !approx::ulps_eq!($left, $right) {
      pretty_assertions::assert_eq!(format!("{:#?}", $left), format!("{:#?}", $right));
      panic!("values are equal when printed, but differ beyond ulps tolerance");
    }
  }};
  ($left:expr, $right:expr, $($eps:tt)+) => {{
    if !approx::ulps_eq!($left, $right, $($eps)+) {
      pretty_assertions::assert_eq!(format!("{:#?}", $left), format!("{:#?}", $right));
      panic!("values are equal when printed, but differ beyond tolerance");
    }
  }};
}
