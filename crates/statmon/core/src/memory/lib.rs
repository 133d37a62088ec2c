// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

/// Cache line size used to separate sub-regions of the shared mapping
pub const CACHE_LINE: usize = 64;

/// Aligns a size to the specified alignment boundary
/// The alignment must be a power of two
pub fn align_to(size: usize, alignment: usize) -> usize {
    debug_assert!(is_power_of_two(alignment));
    (size + alignment - 1) & !(alignment - 1)
}

/// Checks if a number is a power of two
pub fn is_power_of_two(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Gets the next power of two for a given number
/// Used to size the open-addressing index of the statistics table
pub fn next_power_of_two(n: usize) -> usize {
    if n == 0 {
        return 1;
    }

    let mut power = 1;
    while power < n {
        power <<= 1;
    }
    power
}

/// Gets the system page size
/// Mappings are always requested in whole pages
pub fn get_page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }
    #[cfg(not(unix))]
    {
        4096 // Default page size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 64), 0);
        assert_eq!(align_to(1, 64), 64);
        assert_eq!(align_to(64, 64), 64);
        assert_eq!(align_to(65, 8), 72);
    }

    #[test]
    fn test_power_of_two_helpers() {
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(1024));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(12));

        assert_eq!(next_power_of_two(0), 1);
        assert_eq!(next_power_of_two(5), 8);
        assert_eq!(next_power_of_two(16), 16);
    }

    #[test]
    fn test_page_size_is_sane() {
        let page = get_page_size();
        assert!(is_power_of_two(page));
        assert!(page >= 4096);
    }
}
