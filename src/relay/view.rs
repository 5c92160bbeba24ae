use crate::session::location::Coordinates;

/// A rectangular area in latitude / longitude, bounds inclusive. The relay answers `nearby`
///  requests with the participants inside the view around the requester's last reported position.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct View {
    south: f64,
    north: f64,
    west: f64,
    east: f64,
}

impl View {
    /// the square reaching `range` degrees from `center` in each direction
    pub fn around(center: Coordinates, range: f64) -> View {
        let range = range.abs();
        View {
            south: center.latitude - range,
            north: center.latitude + range,
            west: center.longitude - range,
            east: center.longitude + range,
        }
    }

    pub fn contains(&self, position: Coordinates) -> bool {
        position.latitude >= self.south && position.latitude <= self.north
            && position.longitude >= self.west && position.longitude <= self.east
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::center(52.0, 13.0, true)]
    #[case::corner(52.5, 12.5, true)]
    #[case::north_of(52.51, 13.0, false)]
    #[case::south_of(51.49, 13.0, false)]
    #[case::east_of(52.0, 13.51, false)]
    #[case::west_of(52.0, 12.49, false)]
    fn test_contains(#[case] latitude: f64, #[case] longitude: f64, #[case] expected: bool) {
        let view = View::around(Coordinates::new(52.0, 13.0), 0.5);
        assert_eq!(view.contains(Coordinates::new(latitude, longitude)), expected);
    }

    #[test]
    fn test_negative_range_is_treated_as_positive() {
        assert_eq!(View::around(Coordinates::new(1.0, 1.0), -0.5), View::around(Coordinates::new(1.0, 1.0), 0.5));
    }
}
