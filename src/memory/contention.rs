/*!
ULA contention classification.

Only answers *whether* an address is contended under the current paging
state; the per-cycle delay pattern lives in the machine profile and is
applied by the timing-aware CPU core.
*/

use crate::machine::{MachineProfile, PagingModel, UlaProfile};

use super::paging::PagingState;

/// Is `addr` in a contended region for this profile + pager state?
pub(crate) fn is_contended(profile: &MachineProfile, st: &PagingState, addr: u16) -> bool {
    if profile.ula == UlaProfile::NoContention || !profile.contention.mreq {
        return false;
    }
    match profile.paging {
        PagingModel::None => (0x4000..=0x7FFF).contains(&addr),
        PagingModel::Bank128 => match addr {
            0x4000..=0x7FFF => true,
            0xC000..=0xFFFF => st.cur_ram_bank & 1 != 0,
            _ => false,
        },
        PagingModel::Plus2a => {
            if st.special_paging_mode {
                // Contention follows whichever bank each slot maps.
                let slot = (addr >> 14) as usize;
                st.special_banks[slot] >= 4
            } else {
                match addr {
                    0x4000..=0x7FFF => true,
                    0xC000..=0xFFFF => st.cur_ram_bank >= 4,
                    _ => false,
                }
            }
        }
        // Pentagon and Scorpion never contend.
        PagingModel::Pentagon1024 | PagingModel::Scorpion => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{profile, MachineId};
    use crate::memory::paging::{write_1ffd_plus3, write_7ffd};

    #[test]
    fn contention_48k_is_screen_region_only() {
        let p = profile(MachineId::Spectrum48);
        let st = PagingState::new();
        assert!(!is_contended(p, &st, 0x3FFF));
        assert!(is_contended(p, &st, 0x4000));
        assert!(is_contended(p, &st, 0x7FFF));
        assert!(!is_contended(p, &st, 0x8000));
        assert!(!is_contended(p, &st, 0xFFFF));
    }

    #[test]
    fn contention_128k_tracks_odd_banks() {
        let p = profile(MachineId::Spectrum128);
        let mut st = PagingState::new();
        write_7ffd(p, &mut st, 0x00); // bank 0
        assert!(is_contended(p, &st, 0x4000));
        assert!(!is_contended(p, &st, 0xC000));
        write_7ffd(p, &mut st, 0x01); // bank 1, odd
        assert!(is_contended(p, &st, 0xC000));
        write_7ffd(p, &mut st, 0x04); // bank 4, even
        assert!(!is_contended(p, &st, 0xC000));
    }

    #[test]
    fn contention_plus3_tracks_high_banks() {
        let p = profile(MachineId::Plus3);
        let mut st = PagingState::new();
        write_7ffd(p, &mut st, 0x03); // bank 3
        assert!(!is_contended(p, &st, 0xC000));
        write_7ffd(p, &mut st, 0x04); // bank 4
        assert!(is_contended(p, &st, 0xC000));
        // Special paging config 1 maps 4/5/6/7 everywhere.
        write_1ffd_plus3(&mut st, 0x03);
        assert!(is_contended(p, &st, 0x0000));
        assert!(is_contended(p, &st, 0xFFFF));
        // Config 0 maps 0/1/2/3: nothing contends.
        write_1ffd_plus3(&mut st, 0x01);
        assert!(!is_contended(p, &st, 0x0000));
        assert!(!is_contended(p, &st, 0x4000));
    }

    #[test]
    fn clones_never_contend() {
        let pent = profile(MachineId::Pentagon128);
        let st = PagingState::new();
        assert!(!is_contended(pent, &st, 0x4000));
        let scorp = profile(MachineId::Scorpion256);
        assert!(!is_contended(scorp, &st, 0x4000));
    }
}
